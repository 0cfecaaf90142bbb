use std::collections::BTreeMap;

use crate::config::ReconConfig;
use crate::model::{sum_present, FindingRule, LedgerFinding, LedgerRow, Severity};
use crate::normalize::{normalize_document_number, parse_date};

/// Internal consistency of the ledger itself, independent of any document.
///
/// Per row: totals against their rate buckets, and bucket VAT against
/// base × rate. Per document type (when sequence checks are on): gaps and
/// duplicates in the numeric sequence, and dates that go backwards as
/// numbers go up.
pub fn check_ledger(rows: &[LedgerRow], config: &ReconConfig) -> Vec<LedgerFinding> {
    let mut findings = Vec::new();
    for row in rows {
        check_totals(row, config, &mut findings);
        check_rates(row, config, &mut findings);
    }
    if config.sequence_checks() {
        check_sequences(rows, &mut findings);
    }
    tracing::info!(
        rows = rows.len(),
        errors = findings.iter().filter(|f| f.severity == Severity::Error).count(),
        warnings = findings.iter().filter(|f| f.severity == Severity::Warning).count(),
        "ledger check"
    );
    findings
}

fn finding(
    severity: Severity,
    rule: FindingRule,
    row: &LedgerRow,
    message: String,
) -> LedgerFinding {
    LedgerFinding {
        severity,
        rule,
        row_index: Some(row.row_index),
        document_type: row.document_type.clone(),
        message,
    }
}

fn off_by(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() > tolerance + 1e-9
}

fn check_totals(row: &LedgerRow, config: &ReconConfig, findings: &mut Vec<LedgerFinding>) {
    let tol = config.ledger_checks.amount_tolerance;
    let a = &row.amounts;

    let bucket_base = sum_present(&[a.base_20, a.base_9, a.base_0, a.base_no_credit]);
    if let (Some(total), Some(sum)) = (a.total_base, bucket_base) {
        if off_by(total, sum, tol) {
            findings.push(finding(
                Severity::Error,
                FindingRule::TotalBase,
                row,
                format!("total tax base {total:.2} differs from bucket sum {sum:.2}"),
            ));
        }
    }

    let bucket_vat = sum_present(&[a.vat_20, a.vat_9]);
    if let (Some(total), Some(sum)) = (a.total_vat, bucket_vat) {
        if off_by(total, sum, tol) {
            findings.push(finding(
                Severity::Error,
                FindingRule::TotalVat,
                row,
                format!("total VAT {total:.2} differs from bucket sum {sum:.2}"),
            ));
        }
    }
}

fn check_rates(row: &LedgerRow, config: &ReconConfig, findings: &mut Vec<LedgerFinding>) {
    let tol = config.ledger_checks.amount_tolerance;
    let a = &row.amounts;
    let buckets = [(a.base_20, a.vat_20), (a.base_9, a.vat_9)];
    for (rate, (base, vat)) in config.ledger_checks.vat_rates.iter().zip(buckets) {
        let (Some(base), Some(vat)) = (base, vat) else {
            continue;
        };
        let expected = base * rate;
        if off_by(vat, expected, tol) {
            findings.push(finding(
                Severity::Error,
                FindingRule::VatRate,
                row,
                format!(
                    "VAT {vat:.2} is not {:.0}% of {base:.2} (expected {expected:.2})",
                    rate * 100.0
                ),
            ));
        }
    }
}

fn type_group(row: &LedgerRow) -> String {
    row.document_type
        .as_deref()
        .map(|t| t.trim().trim_end_matches('.').to_uppercase())
        .unwrap_or_default()
}

fn check_sequences(rows: &[LedgerRow], findings: &mut Vec<LedgerFinding>) {
    let mut groups: BTreeMap<String, Vec<(u64, &LedgerRow)>> = BTreeMap::new();
    for row in rows {
        let number = row
            .document_number
            .as_deref()
            .map(normalize_document_number)
            .and_then(|n| n.parse::<u64>().ok());
        // numbers that are not purely numeric have no sequence to check
        if let Some(number) = number {
            groups.entry(type_group(row)).or_default().push((number, row));
        }
    }

    for entries in groups.values_mut() {
        entries.sort_by_key(|(n, _)| *n);
        for pair in entries.windows(2) {
            let (prev_no, prev) = pair[0];
            let (no, row) = pair[1];

            if no == prev_no {
                findings.push(finding(
                    Severity::Error,
                    FindingRule::DuplicateNumber,
                    row,
                    format!("document number {no} also used on row {}", prev.row_index),
                ));
                continue;
            }
            if no > prev_no + 1 {
                findings.push(finding(
                    Severity::Warning,
                    FindingRule::SequenceGap,
                    row,
                    format!(
                        "gap after {prev_no}: {} number(s) missing before {no}",
                        no - prev_no - 1
                    ),
                ));
            }

            let prev_date = prev.document_date.as_deref().and_then(parse_date);
            let date = row.document_date.as_deref().and_then(parse_date);
            if let (Some(prev_date), Some(date)) = (prev_date, date) {
                if date < prev_date {
                    findings.push(finding(
                        Severity::Warning,
                        FindingRule::DateOrder,
                        row,
                        format!("number {no} dated {date}, before {prev_no} dated {prev_date}"),
                    ));
                }
            }
        }
    }
}
