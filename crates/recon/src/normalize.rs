//! Canonical forms for values coming from OCR text, spreadsheet cells and
//! Excel serial dates, so that the comparator never compares raw strings.
//!
//! Every normalizer here is idempotent: feeding its output back in yields
//! the same value.

use chrono::{Datelike, NaiveDate};

// ---------------------------------------------------------------------------
// Document numbers
// ---------------------------------------------------------------------------

/// Canonical document-number key: alphanumerics only, lowercased, leading
/// zeros stripped. `"№ 0000012345"` and `"12345"` share the key `"12345"`.
pub fn normalize_document_number(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect();
    cleaned.trim_start_matches('0').to_string()
}

/// Two numbers are the same key iff their normalized forms are equal and
/// non-empty. Empty keys never match each other.
pub fn same_document_key(a: &str, b: &str) -> bool {
    let a = normalize_document_number(a);
    !a.is_empty() && a == normalize_document_number(b)
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// A calendar date decomposed into components. Two dates match iff all
/// three components are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateParts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl DateParts {
    fn from_naive(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }

    fn checked(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self::from_naive)
    }

    pub fn to_naive(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

impl std::fmt::Display for DateParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}.{:02}.{:04}", self.day, self.month, self.year)
    }
}

/// Spreadsheet day zero. Serial 1 is 1899-12-31, serial 61 is 1900-03-01
/// (the 1900 leap-day bug is absorbed by starting one day early).
fn serial_epoch() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1899, 12, 30)
}

/// Convert a spreadsheet serial day number. The fractional (time) part is
/// dropped; arithmetic is on naive dates so no timezone can shift the day.
pub fn date_from_serial(serial: f64) -> Option<DateParts> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    let days = serial.floor() as u64;
    serial_epoch()?
        .checked_add_days(chrono::Days::new(days))
        .map(DateParts::from_naive)
}

/// Two-digit years: `< 50` are 2000s, `>= 50` are 1900s.
fn expand_year(raw: &str) -> Option<i32> {
    let year: i32 = raw.parse().ok()?;
    match raw.len() {
        2 if year < 50 => Some(2000 + year),
        2 => Some(1900 + year),
        4 => Some(year),
        _ => None,
    }
}

/// A bare number of 3..=6 integer digits (optionally with a fraction) is a
/// serial date. Day-first dates never have more than two leading digits.
fn looks_like_serial(token: &str) -> bool {
    let (int_part, frac_part) = match token.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (token, None),
    };
    (3..=6).contains(&int_part.len())
        && int_part.chars().all(|c| c.is_ascii_digit())
        && frac_part.map_or(true, |f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

/// Parse the date formats seen across extractors and ledger exports:
/// `DD.MM.YYYY`, `DD/MM/YYYY`, `DD-MM-YYYY`, `YYYY-MM-DD`, two-digit years,
/// compact `YYYYMMDD`, and spreadsheet serial numbers. Trailing text such
/// as a time component or the Bulgarian year marker `г.` is ignored.
pub fn parse_date(raw: &str) -> Option<DateParts> {
    let token = raw
        .trim()
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()?
        .trim_end_matches(|c: char| !c.is_ascii_digit());
    if token.is_empty() {
        return None;
    }

    if token.len() == 8 && token.chars().all(|c| c.is_ascii_digit()) {
        let year = token[0..4].parse().ok()?;
        let month = token[4..6].parse().ok()?;
        let day = token[6..8].parse().ok()?;
        return DateParts::checked(year, month, day);
    }

    if looks_like_serial(token) {
        return date_from_serial(token.parse().ok()?);
    }

    let parts: Vec<&str> = token.split(['.', '/', '-']).map(str::trim).collect();
    if parts.len() != 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }

    if parts[0].len() == 4 {
        let month = parts[1].parse().ok()?;
        let day = parts[2].parse().ok()?;
        return DateParts::checked(parts[0].parse().ok()?, month, day);
    }

    if parts[0].len() > 2 || parts[1].len() > 2 {
        return None;
    }
    let day = parts[0].parse().ok()?;
    let month = parts[1].parse().ok()?;
    DateParts::checked(expand_year(parts[2])?, month, day)
}

/// Canonical `DD.MM.YYYY` form, or `None` when the input is not a date.
pub fn normalize_date(raw: &str) -> Option<String> {
    parse_date(raw).map(|d| d.to_string())
}

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

/// Parse a monetary amount written in any of the locales seen in practice.
///
/// - `1 234,56` / `1.234,56` / `1,234.56` → `1234.56`: the last separator is
///   the decimal point, every other separator (space, extra dot) is grouping
/// - `1.000.000` → `1000000`: a separator that occurs more than once is
///   grouping throughout
/// - `.50` → `0.5`
/// - `(1234.56)` → `-1234.56`
/// - an explicit leading minus survives all cleanup
/// - currency text (`лв.`, `BGN`, `€`) is ignored
pub fn parse_amount(raw: &str) -> Option<f64> {
    let trimmed = raw
        .trim()
        .trim_end_matches(|c: char| !c.is_ascii_digit() && c != ')');
    let mut body = amount_start(trimmed).map_or("", |at| &trimmed[at..]);
    let mut negative = false;

    if let Some(inner) = body.strip_prefix('(').and_then(|b| b.strip_suffix(')')) {
        negative = true;
        body = inner.trim();
    }
    if body.starts_with('-') || body.starts_with('−') {
        negative = true;
    }

    let kept: Vec<char> = body
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if !kept.iter().any(|c| c.is_ascii_digit()) {
        return None;
    }

    // a separator that repeats can only be grouping
    let decimal_at = kept
        .iter()
        .rposition(|c| *c == ',' || *c == '.')
        .filter(|&at| kept.iter().filter(|c| **c == kept[at]).count() == 1);
    let mut canonical = String::with_capacity(kept.len() + 2);
    if negative {
        canonical.push('-');
    }
    for (i, c) in kept.iter().enumerate() {
        if c.is_ascii_digit() {
            canonical.push(*c);
        } else if Some(i) == decimal_at {
            canonical.push('.');
        }
    }

    canonical.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Byte offset where the amount proper begins: the first digit, sign or
/// opening parenthesis, or a separator directly followed by a digit
/// (`.50`). Leading currency text is skipped.
fn amount_start(s: &str) -> Option<usize> {
    let mut chars = s.char_indices().peekable();
    while let Some((at, c)) = chars.next() {
        if c.is_ascii_digit() || matches!(c, '-' | '−' | '(') {
            return Some(at);
        }
        if matches!(c, '.' | ',') && chars.peek().map_or(false, |(_, n)| n.is_ascii_digit()) {
            return Some(at);
        }
    }
    None
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Whole cents, after rounding to two decimals.
pub fn to_cents(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

// ---------------------------------------------------------------------------
// Credit notes
// ---------------------------------------------------------------------------

const CREDIT_NOTE_KEYWORDS: &[&str] = &["кредитно", "credit note", "credit memo", "creditnote"];

/// Ledger codes that stand for a credit note on their own.
const CREDIT_NOTE_CODES: &[&str] = &["КИ", "03"];

/// True when the document type names a credit note, by keyword
/// (case-insensitive) or by its ledger code.
pub fn is_credit_note(document_type: Option<&str>) -> bool {
    let Some(raw) = document_type else {
        return false;
    };
    let trimmed = raw.trim().trim_end_matches('.');
    let upper = trimmed.to_uppercase();
    if CREDIT_NOTE_CODES.contains(&upper.as_str()) {
        return true;
    }
    let lower = trimmed.to_lowercase();
    CREDIT_NOTE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Credit notes always reduce the ledger: force negative magnitude.
pub fn normalize_credit_sign(amount: f64, credit_note: bool) -> f64 {
    if credit_note {
        -amount.abs()
    } else {
        amount
    }
}

// ---------------------------------------------------------------------------
// Counterparty identifiers
// ---------------------------------------------------------------------------

/// Uppercased alphanumerics of an EIK / VAT number.
pub fn normalize_counterparty_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

/// Two-letter country prefix of a normalized VAT id (`BG`, `DE`, ...).
pub fn country_prefix(normalized: &str) -> Option<&str> {
    let mut chars = normalized.char_indices();
    let (_, a) = chars.next()?;
    let (_, b) = chars.next()?;
    let rest_starts_with_digit = chars.next().map_or(false, |(_, c)| c.is_ascii_digit());
    if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() && rest_starts_with_digit {
        Some(&normalized[..2])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Serde intake
// ---------------------------------------------------------------------------

/// Deserialize an optional amount from a JSON number or a locale string.
/// Anything unparseable becomes `None` rather than an error.
pub mod serde_amount {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAmount {
        Number(f64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<RawAmount>::deserialize(deserializer)?;
        Ok(match raw {
            Some(RawAmount::Number(n)) if n.is_finite() => Some(n),
            Some(RawAmount::Text(s)) => super::parse_amount(&s),
            _ => None,
        })
    }
}

/// Lenient intake for identifier and date fields. Spreadsheet exports put
/// numbers where text is expected (document numbers, serial dates), so a
/// number is kept in its plain decimal form. Any other non-string value
/// becomes `None`.
pub mod serde_text {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawText {
        Text(String),
        Int(i64),
        UInt(u64),
        Float(f64),
        Other(serde::de::IgnoredAny),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<RawText>::deserialize(deserializer)?;
        Ok(match raw {
            Some(RawText::Text(s)) => Some(s),
            Some(RawText::Int(n)) => Some(n.to_string()),
            Some(RawText::UInt(n)) => Some(n.to_string()),
            Some(RawText::Float(f)) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                Some(format!("{f:.0}"))
            }
            Some(RawText::Float(f)) if f.is_finite() => Some(f.to_string()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(year: i32, month: u32, day: u32) -> DateParts {
        DateParts { year, month, day }
    }

    #[test]
    fn document_number_forms() {
        assert_eq!(normalize_document_number("00012345"), "12345");
        assert_eq!(normalize_document_number("№ 0000-012/345"), "12345");
        assert_eq!(normalize_document_number("INV-0042A"), "inv0042a");
        assert_eq!(normalize_document_number("ФК-001"), "фк001");
        assert_eq!(normalize_document_number("0000"), "");
    }

    #[test]
    fn document_number_idempotent() {
        for raw in ["00012345", "INV-0042A", " 12/34 ", "ФК-001", "000"] {
            let once = normalize_document_number(raw);
            assert_eq!(normalize_document_number(&once), once);
        }
    }

    #[test]
    fn empty_keys_never_match() {
        assert!(!same_document_key("", ""));
        assert!(!same_document_key("000", "0"));
        assert!(!same_document_key("--", "--"));
        assert!(same_document_key("00012345", "12345"));
    }

    #[test]
    fn day_first_formats() {
        assert_eq!(parse_date("05.03.2024"), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("5/3/2024"), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("05-03-2024"), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("05.03.2024 г."), Some(d(2024, 3, 5)));
        assert_eq!(parse_date(" 05.03.2024г "), Some(d(2024, 3, 5)));
    }

    #[test]
    fn iso_and_compact_formats() {
        assert_eq!(parse_date("2024-03-05"), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("2024-03-05T00:00:00Z"), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("2024-03-05 10:15"), Some(d(2024, 3, 5)));
        assert_eq!(parse_date("20240305"), Some(d(2024, 3, 5)));
    }

    #[test]
    fn two_digit_year_pivot() {
        assert_eq!(parse_date("01.02.49"), Some(d(2049, 2, 1)));
        assert_eq!(parse_date("01.02.50"), Some(d(1950, 2, 1)));
        assert_eq!(parse_date("01.02.24"), Some(d(2024, 2, 1)));
    }

    #[test]
    fn serial_dates() {
        assert_eq!(parse_date("45292"), Some(d(2024, 1, 1)));
        assert_eq!(parse_date("45292.75"), Some(d(2024, 1, 1)));
        assert_eq!(date_from_serial(1.0), Some(d(1899, 12, 31)));
        assert_eq!(date_from_serial(0.0), None);
        assert_eq!(date_from_serial(f64::NAN), None);
    }

    #[test]
    fn invalid_dates() {
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("31.02.2024"), None);
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date("12.2024"), None);
        assert_eq!(parse_date("123.04.2024"), None);
    }

    #[test]
    fn date_padding_does_not_matter() {
        assert_eq!(parse_date("5.3.2024"), parse_date("05.03.2024"));
        assert_eq!(parse_date("2024-3-5"), parse_date("05/03/24"));
    }

    #[test]
    fn date_idempotent() {
        for raw in ["5.3.2024", "2024-03-05", "45292", "01.02.49", "20240305"] {
            let once = normalize_date(raw).unwrap();
            assert_eq!(normalize_date(&once).unwrap(), once);
        }
    }

    #[test]
    fn amount_locales() {
        assert_eq!(parse_amount("1234.56"), Some(1234.56));
        assert_eq!(parse_amount("1234,56"), Some(1234.56));
        assert_eq!(parse_amount("1 234,56"), Some(1234.56));
        assert_eq!(parse_amount("1\u{a0}234,56 лв."), Some(1234.56));
        assert_eq!(parse_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_amount("1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("1.234.567,89"), Some(1234567.89));
        assert_eq!(parse_amount("BGN 100"), Some(100.0));
        assert_eq!(parse_amount("лв. 100"), Some(100.0));
    }

    #[test]
    fn repeated_separator_is_grouping() {
        assert_eq!(parse_amount("1.000.000"), Some(1_000_000.0));
        assert_eq!(parse_amount("2.500.000 лв."), Some(2_500_000.0));
        assert_eq!(parse_amount("1,234,567"), Some(1_234_567.0));
        assert_eq!(parse_amount("1 000 000"), Some(1_000_000.0));
        // single separator still reads as decimal
        assert_eq!(parse_amount("1.000"), Some(1.0));
    }

    #[test]
    fn leading_separator_is_decimal() {
        assert_eq!(parse_amount(".50"), Some(0.5));
        assert_eq!(parse_amount(",75 лв."), Some(0.75));
        assert_eq!(parse_amount("-.25"), Some(-0.25));
    }

    #[test]
    fn amount_signs() {
        assert_eq!(parse_amount("(1234.56)"), Some(-1234.56));
        assert_eq!(parse_amount("-1 234,56"), Some(-1234.56));
        assert_eq!(parse_amount("−50,00"), Some(-50.0));
        assert_eq!(parse_amount("- 12.5"), Some(-12.5));
    }

    #[test]
    fn amount_rejects_garbage() {
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_amount("()"), None);
    }

    #[test]
    fn amount_idempotent() {
        for raw in ["1 234,56", "(99,10)", "-0.5", "1.234.567,89"] {
            let once = parse_amount(raw).unwrap();
            let again = parse_amount(&format!("{once:.2}")).unwrap();
            assert_eq!(once, again);
        }
    }

    #[test]
    fn rounding() {
        assert_eq!(round2(1000.015_1), 1000.02);
        assert_eq!(to_cents(1000.02), 100_002);
        assert_eq!(to_cents(-0.004), 0);
    }

    #[test]
    fn credit_note_detection() {
        assert!(is_credit_note(Some("Кредитно известие")));
        assert!(is_credit_note(Some("КРЕДИТНО ИЗВЕСТИЕ №5")));
        assert!(is_credit_note(Some("Credit Note")));
        assert!(is_credit_note(Some("КИ")));
        assert!(is_credit_note(Some(" ки. ")));
        assert!(!is_credit_note(Some("Фактура")));
        assert!(!is_credit_note(Some("Дебитно известие")));
        assert!(!is_credit_note(None));
    }

    #[test]
    fn credit_sign_forced_negative() {
        assert_eq!(normalize_credit_sign(100.0, true), -100.0);
        assert_eq!(normalize_credit_sign(-100.0, true), -100.0);
        assert_eq!(normalize_credit_sign(100.0, false), 100.0);
    }

    #[test]
    fn counterparty_normalization() {
        assert_eq!(normalize_counterparty_id("bg 123 456 789"), "BG123456789");
        assert_eq!(country_prefix("BG123456789"), Some("BG"));
        assert_eq!(country_prefix("123456789"), None);
        assert_eq!(country_prefix("ABC"), None);
    }

    #[test]
    fn serde_amount_accepts_numbers_and_strings() {
        #[derive(serde::Deserialize)]
        struct Row {
            #[serde(default, deserialize_with = "serde_amount::deserialize")]
            a: Option<f64>,
        }
        let parse = |json: &str| serde_json::from_str::<Row>(json).unwrap().a;
        assert_eq!(parse(r#"{"a": 12}"#), Some(12.0));
        assert_eq!(parse(r#"{"a": "12,50"}"#), Some(12.5));
        assert_eq!(parse(r#"{"a": "??"}"#), None);
        assert_eq!(parse(r#"{"a": null}"#), None);
        assert_eq!(parse(r#"{"a": true}"#), None);
        assert_eq!(parse(r#"{}"#), None);
    }
}
