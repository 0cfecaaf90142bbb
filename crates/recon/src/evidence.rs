use std::collections::BTreeMap;

use crate::config::LabelConfig;
use crate::model::{ComparisonResult, OverallStatus, VerificationSummary, VerificationTotals};

/// Tally per-status counts over the results of one run.
pub fn compute_totals(
    results: &[ComparisonResult],
    ledger_rows: usize,
    missing_rows: usize,
    foreign_rows_excluded: usize,
) -> VerificationTotals {
    let mut totals = VerificationTotals {
        documents: results.len(),
        ledger_rows,
        missing_rows,
        foreign_rows_excluded,
        ..VerificationTotals::default()
    };

    for r in results {
        *totals
            .status_counts
            .entry(r.status.as_str().to_string())
            .or_insert(0) += 1;

        match r.status {
            OverallStatus::Match => totals.matched += 1,
            OverallStatus::Suspicious => totals.suspicious += 1,
            OverallStatus::Unreadable => totals.unreadable += 1,
            OverallStatus::NotFound => totals.not_found += 1,
        }
    }

    totals
}

/// Label per ledger row index for the export step: claimed rows get the
/// label of their document's status, unclaimed rows the missing label.
/// Foreign rows left out of `missing_rows` get no label.
pub fn row_labels(summary: &VerificationSummary, labels: &LabelConfig) -> BTreeMap<usize, String> {
    let mut out = BTreeMap::new();
    for r in &summary.results {
        if let Some(row) = r.matched_row {
            out.insert(row, labels.for_status(r.status).to_string());
        }
    }
    for row in &summary.missing_rows {
        out.insert(row.row_index, labels.missing.clone());
    }
    out
}
