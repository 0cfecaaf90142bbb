use std::collections::BTreeMap;

use crate::config::{ReconConfig, Tolerances};
use crate::model::{
    ExtractedDocument, FieldComparison, FieldId, FieldStatus, Flow, LedgerRow, OverallStatus,
};
use crate::normalize::{
    country_prefix, is_credit_note, normalize_counterparty_id, normalize_credit_sign,
    normalize_document_number, parse_date, round2, to_cents,
};

/// Shortest id that may match another id as a trailing substring.
const MIN_SUFFIX_LEN: usize = 6;

// ---------------------------------------------------------------------------
// Document type table
// ---------------------------------------------------------------------------

/// Ledger type code → accepted natural-language variants, all uppercased.
#[derive(Debug, Clone)]
pub struct TypeTable {
    codes: BTreeMap<String, Vec<String>>,
}

const BUILTIN_TYPES: &[(&str, &[&str])] = &[
    ("Ф-РА", &["ФАКТУРА", "INVOICE", "Ф-РА"]),
    ("ФАКТУРА", &["ФАКТУРА", "INVOICE", "Ф-РА"]),
    ("КИ", &["КРЕДИТНО", "CREDIT", "КИ"]),
    ("ДИ", &["ДЕБИТНО", "DEBIT", "ДИ"]),
    ("01", &["ФАКТУРА", "INVOICE", "Ф-РА"]),
    ("02", &["ДЕБИТНО", "DEBIT", "ДИ"]),
    ("03", &["КРЕДИТНО", "CREDIT", "КИ"]),
    ("09", &["ПРОТОКОЛ", "PROTOCOL"]),
    ("ПР", &["ПРОТОКОЛ", "PROTOCOL"]),
];

fn type_key(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_uppercase()
}

impl TypeTable {
    pub fn builtin() -> Self {
        let codes = BUILTIN_TYPES
            .iter()
            .map(|(code, variants)| {
                (
                    code.to_string(),
                    variants.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect();
        Self { codes }
    }

    /// Built-in table extended by configured codes. A configured code
    /// replaces a built-in one of the same name.
    pub fn with_overrides(overrides: &BTreeMap<String, Vec<String>>) -> Self {
        let mut table = Self::builtin();
        for (code, variants) in overrides {
            let variants: Vec<String> = variants
                .iter()
                .map(|v| type_key(v))
                .filter(|v| !v.is_empty())
                .collect();
            table.codes.insert(type_key(code), variants);
        }
        table
    }

    /// True when the extracted type names the ledger's type code.
    pub fn matches(&self, extracted: &str, ledger_code: &str) -> bool {
        let extracted = extracted.to_uppercase();
        let code = type_key(ledger_code);
        match self.codes.get(&code) {
            Some(variants) => variants.iter().any(|v| extracted.contains(v.as_str())),
            None => !code.is_empty() && extracted.contains(code.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Field equality rules
// ---------------------------------------------------------------------------

/// Counterparty ids are equal after dropping a country prefix present on one
/// side only, or when the shorter is a trailing part of the longer (OCR
/// often truncates the leading digits).
pub fn same_counterparty(a: &str, b: &str) -> bool {
    let a = normalize_counterparty_id(a);
    let b = normalize_counterparty_id(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let (a, b) = match (country_prefix(&a), country_prefix(&b)) {
        (Some(_), None) => (&a[2..], b.as_str()),
        (None, Some(_)) => (a.as_str(), &b[2..]),
        _ => (a.as_str(), b.as_str()),
    };
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.chars().count() >= MIN_SUFFIX_LEN && long.ends_with(short)
}

/// Compare two amounts in whole cents after credit-sign normalization.
/// Strict: a difference of exactly `tolerance` is not a match.
pub fn amounts_match(extracted: f64, ledger: f64, tolerance: f64, credit_note: bool) -> bool {
    let e = normalize_credit_sign(round2(extracted), credit_note);
    let l = normalize_credit_sign(round2(ledger), credit_note);
    let diff_cents = (to_cents(e) - to_cents(l)).abs() as f64;
    let tolerance_cents = (tolerance * 100.0 * 1e6).round() / 1e6;
    diff_cents < tolerance_cents
}

// ---------------------------------------------------------------------------
// Comparator
// ---------------------------------------------------------------------------

/// Per-field comparison of an extracted document against a ledger row,
/// under one flow's tolerances and type table.
#[derive(Debug, Clone)]
pub struct Comparator {
    flow: Flow,
    tolerances: Tolerances,
    types: TypeTable,
}

/// One side of a field: the raw value for display, and whether it survived
/// normalization.
struct Side {
    display: Option<String>,
    usable: bool,
}

impl Side {
    fn text(value: Option<&String>, usable: impl Fn(&str) -> bool) -> Self {
        match value {
            Some(v) => Side {
                display: Some(v.clone()),
                usable: usable(v),
            },
            None => Side {
                display: None,
                usable: false,
            },
        }
    }

    fn amount(value: Option<f64>) -> Self {
        Side {
            display: value.map(|v| format!("{v:.2}")),
            usable: value.map_or(false, f64::is_finite),
        }
    }
}

fn non_empty_type(raw: &str) -> bool {
    !type_key(raw).is_empty()
}

fn usable_number(raw: &str) -> bool {
    !normalize_document_number(raw).is_empty()
}

fn usable_date(raw: &str) -> bool {
    parse_date(raw).is_some()
}

fn usable_id(raw: &str) -> bool {
    !normalize_counterparty_id(raw).is_empty()
}

impl Comparator {
    pub fn new(config: &ReconConfig) -> Self {
        Self {
            flow: config.flow,
            tolerances: config.tolerances(),
            types: TypeTable::with_overrides(&config.type_codes),
        }
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn tolerances(&self) -> &Tolerances {
        &self.tolerances
    }

    /// Compare every field of the flow. With no row, each field is
    /// `unreadable` (no extracted value) or `missing`.
    pub fn compare(
        &self,
        doc: &ExtractedDocument,
        row: Option<&LedgerRow>,
    ) -> Vec<FieldComparison> {
        let credit_note = is_credit_note(doc.document_type.as_deref())
            || row.map_or(false, |r| is_credit_note(r.document_type.as_deref()));
        let (ledger_base, ledger_vat) = row
            .map(|r| r.applicable_amounts(self.flow))
            .unwrap_or((None, None));

        self.flow
            .fields()
            .iter()
            .map(|&field| {
                let (extracted, ledger) = match field {
                    FieldId::DocumentType => (
                        Side::text(doc.document_type.as_ref(), non_empty_type),
                        Side::text(row.and_then(|r| r.document_type.as_ref()), non_empty_type),
                    ),
                    FieldId::DocumentNumber => (
                        Side::text(doc.document_number.as_ref(), usable_number),
                        Side::text(row.and_then(|r| r.document_number.as_ref()), usable_number),
                    ),
                    FieldId::DocumentDate => (
                        Side::text(doc.document_date.as_ref(), usable_date),
                        Side::text(row.and_then(|r| r.document_date.as_ref()), usable_date),
                    ),
                    FieldId::CounterpartyId => (
                        Side::text(doc.counterparty_id.as_ref(), usable_id),
                        Side::text(row.and_then(|r| r.counterparty_id.as_ref()), usable_id),
                    ),
                    FieldId::CounterpartyVatId => (
                        Side::text(doc.counterparty_vat_id.as_ref(), usable_id),
                        Side::text(row.and_then(|r| r.counterparty_vat_id.as_ref()), usable_id),
                    ),
                    FieldId::TaxBase => (Side::amount(doc.tax_base), Side::amount(ledger_base)),
                    FieldId::Vat => (Side::amount(doc.vat), Side::amount(ledger_vat)),
                };

                let status = if !extracted.usable {
                    FieldStatus::Unreadable
                } else if !ledger.usable {
                    FieldStatus::Missing
                } else if self.field_equal(field, doc, row, ledger_base, ledger_vat, credit_note) {
                    FieldStatus::Match
                } else {
                    FieldStatus::Suspicious
                };

                FieldComparison {
                    field,
                    extracted: extracted.display,
                    ledger: ledger.display,
                    status,
                }
            })
            .collect()
    }

    /// Only called once both sides are known to be usable.
    fn field_equal(
        &self,
        field: FieldId,
        doc: &ExtractedDocument,
        row: Option<&LedgerRow>,
        ledger_base: Option<f64>,
        ledger_vat: Option<f64>,
        credit_note: bool,
    ) -> bool {
        let Some(row) = row else {
            return false;
        };
        match field {
            FieldId::DocumentType => match (&doc.document_type, &row.document_type) {
                (Some(e), Some(l)) => self.types.matches(e, l),
                _ => false,
            },
            FieldId::DocumentNumber => match (&doc.document_number, &row.document_number) {
                (Some(e), Some(l)) => normalize_document_number(e) == normalize_document_number(l),
                _ => false,
            },
            FieldId::DocumentDate => match (&doc.document_date, &row.document_date) {
                (Some(e), Some(l)) => parse_date(e).is_some() && parse_date(e) == parse_date(l),
                _ => false,
            },
            FieldId::CounterpartyId => match (&doc.counterparty_id, &row.counterparty_id) {
                (Some(e), Some(l)) => same_counterparty(e, l),
                _ => false,
            },
            FieldId::CounterpartyVatId => {
                match (&doc.counterparty_vat_id, &row.counterparty_vat_id) {
                    (Some(e), Some(l)) => same_counterparty(e, l),
                    _ => false,
                }
            }
            FieldId::TaxBase => match (doc.tax_base, ledger_base) {
                (Some(e), Some(l)) => amounts_match(e, l, self.tolerances.tax_base, credit_note),
                _ => false,
            },
            FieldId::Vat => match (doc.vat, ledger_vat) {
                (Some(e), Some(l)) => amounts_match(e, l, self.tolerances.vat, credit_note),
                _ => false,
            },
        }
    }

    /// Number of compared fields that are not a clean match.
    pub fn mismatch_count(&self, doc: &ExtractedDocument, row: &LedgerRow) -> usize {
        mismatch_count(&self.compare(doc, Some(row)))
    }
}

pub fn mismatch_count(fields: &[FieldComparison]) -> usize {
    fields
        .iter()
        .filter(|f| f.status != FieldStatus::Match)
        .count()
}

/// Overall status of a matched document. `NotFound` is never produced here;
/// it belongs to documents the matcher left without a row.
pub fn overall_status(fields: &[FieldComparison]) -> OverallStatus {
    if fields.iter().any(|f| f.status == FieldStatus::Suspicious) {
        OverallStatus::Suspicious
    } else if fields.iter().any(|f| f.status == FieldStatus::Unreadable) {
        OverallStatus::Unreadable
    } else {
        OverallStatus::Match
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Confidence;

    fn doc() -> ExtractedDocument {
        let mut d = ExtractedDocument::unreadable(0, "inv.pdf");
        d.confidence = Confidence::High;
        d.document_type = Some("ФАКТУРА".into());
        d.document_number = Some("00012345".into());
        d.document_date = Some("05.03.2024".into());
        d.counterparty_id = Some("BG123456789".into());
        d.tax_base = Some(1000.02);
        d.vat = Some(200.0);
        d
    }

    fn row() -> LedgerRow {
        let mut r = LedgerRow::new(1);
        r.document_type = Some("Ф-ра".into());
        r.document_number = Some("12345".into());
        r.document_date = Some("2024-03-05".into());
        r.counterparty_id = Some("123456789".into());
        r.amounts.total_base = Some(1000.0);
        r.amounts.total_vat = Some(200.0);
        r
    }

    fn purchase() -> Comparator {
        Comparator::new(&ReconConfig::for_flow(Flow::Purchase))
    }

    fn status_of(fields: &[FieldComparison], field: FieldId) -> FieldStatus {
        fields.iter().find(|f| f.field == field).unwrap().status
    }

    #[test]
    fn invoice_against_short_code_matches() {
        let fields = purchase().compare(&doc(), Some(&row()));
        assert_eq!(fields.len(), 6);
        assert_eq!(mismatch_count(&fields), 0, "{fields:?}");
        assert_eq!(overall_status(&fields), OverallStatus::Match);
    }

    #[test]
    fn null_extracted_is_unreadable_and_null_ledger_is_missing() {
        let mut d = doc();
        d.document_date = None;
        let mut r = row();
        r.counterparty_id = None;
        let fields = purchase().compare(&d, Some(&r));
        assert_eq!(status_of(&fields, FieldId::DocumentDate), FieldStatus::Unreadable);
        assert_eq!(status_of(&fields, FieldId::CounterpartyId), FieldStatus::Missing);
        assert_eq!(mismatch_count(&fields), 2);
        assert_eq!(overall_status(&fields), OverallStatus::Unreadable);
    }

    #[test]
    fn unparseable_values() {
        let mut d = doc();
        d.document_date = Some("n/a".into());
        let mut r = row();
        r.document_number = Some("---".into());
        let fields = purchase().compare(&d, Some(&r));
        assert_eq!(status_of(&fields, FieldId::DocumentDate), FieldStatus::Unreadable);
        assert_eq!(status_of(&fields, FieldId::DocumentNumber), FieldStatus::Missing);
    }

    #[test]
    fn suspicious_outranks_unreadable() {
        let mut d = doc();
        d.vat = Some(150.0);
        d.document_date = None;
        let fields = purchase().compare(&d, Some(&row()));
        assert_eq!(status_of(&fields, FieldId::Vat), FieldStatus::Suspicious);
        assert_eq!(overall_status(&fields), OverallStatus::Suspicious);
    }

    #[test]
    fn missing_alone_keeps_match() {
        let mut r = row();
        r.document_date = None;
        let fields = purchase().compare(&doc(), Some(&r));
        assert_eq!(mismatch_count(&fields), 1);
        assert_eq!(overall_status(&fields), OverallStatus::Match);
    }

    #[test]
    fn no_row_yields_unreadable_or_missing() {
        let mut d = doc();
        d.vat = None;
        let fields = purchase().compare(&d, None);
        assert_eq!(status_of(&fields, FieldId::Vat), FieldStatus::Unreadable);
        assert_eq!(status_of(&fields, FieldId::TaxBase), FieldStatus::Missing);
        assert!(fields.iter().all(|f| f.ledger.is_none()));
    }

    #[test]
    fn tolerance_is_strict() {
        assert!(!amounts_match(100.03, 100.00, 0.03, false));
        assert!(amounts_match(100.02, 100.00, 0.03, false));
        assert!(!amounts_match(100.01, 100.00, 0.005, false));
        assert!(amounts_match(100.00, 100.00, 0.005, false));
    }

    #[test]
    fn credit_sign_invariance() {
        assert!(amounts_match(100.0, -100.0, 0.02, true));
        assert!(amounts_match(-100.0, -100.0, 0.02, true));
        assert!(!amounts_match(100.0, -100.0, 0.02, false));
    }

    #[test]
    fn credit_note_from_either_side() {
        let mut d = doc();
        d.document_type = Some("Кредитно известие".into());
        d.tax_base = Some(100.0);
        d.vat = Some(20.0);
        let mut r = row();
        r.document_type = Some("КИ".into());
        r.amounts.total_base = Some(-100.0);
        r.amounts.total_vat = Some(-20.0);
        let fields = purchase().compare(&d, Some(&r));
        assert_eq!(status_of(&fields, FieldId::DocumentType), FieldStatus::Match);
        assert_eq!(status_of(&fields, FieldId::TaxBase), FieldStatus::Match);
        assert_eq!(status_of(&fields, FieldId::Vat), FieldStatus::Match);
    }

    #[test]
    fn type_table_lookup() {
        let table = TypeTable::builtin();
        assert!(table.matches("Фактура оригинал", "Ф-ра"));
        assert!(table.matches("invoice", "01"));
        assert!(!table.matches("ФАКТУРА", "КИ"));
        assert!(table.matches("ПРОТОКОЛ ЧЛ. 117", "09"));
        // unknown codes fall back to containment
        assert!(table.matches("АКТ ЗА ПРИЕМАНЕ", "акт"));
        assert!(!table.matches("ФАКТУРА", ""));
    }

    #[test]
    fn type_table_overrides() {
        let mut extra = BTreeMap::new();
        extra.insert("ал".to_string(), vec!["Анулиран".to_string()]);
        let table = TypeTable::with_overrides(&extra);
        assert!(table.matches("АНУЛИРАН ДОКУМЕНТ", "АЛ"));
        assert!(table.matches("ФАКТУРА", "Ф-РА"));
    }

    #[test]
    fn counterparty_prefix_and_truncation() {
        assert!(same_counterparty("BG 123456789", "123456789"));
        assert!(same_counterparty("123456789", "bg123456789"));
        assert!(same_counterparty("3456789", "123456789"));
        assert!(!same_counterparty("6789", "123456789"));
        assert!(!same_counterparty("DE123456789", "BG123456789"));
        assert!(!same_counterparty("", ""));
    }

    #[test]
    fn sales_compares_vat_id_too() {
        let cmp = Comparator::new(&ReconConfig::for_flow(Flow::Sales));
        let mut d = doc();
        d.counterparty_vat_id = Some("BG123456789".into());
        let mut r = row();
        r.amounts.base_20 = Some(1000.0);
        r.amounts.vat_20 = Some(200.0);
        r.counterparty_vat_id = Some("BG999999999".into());
        let fields = cmp.compare(&d, Some(&r));
        assert_eq!(fields.len(), 7);
        assert_eq!(status_of(&fields, FieldId::CounterpartyVatId), FieldStatus::Suspicious);
        assert_eq!(status_of(&fields, FieldId::TaxBase), FieldStatus::Match);
    }
}
