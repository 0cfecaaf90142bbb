use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::arbitrate::{arbitrate_flagged, resolve};
use crate::compare::{mismatch_count, overall_status, Comparator};
use crate::config::ReconConfig;
use crate::error::ReconError;
use crate::evidence::compute_totals;
use crate::extract::{ExtractionService, Pacer, SourceDocument};
use crate::ledger_check::check_ledger;
use crate::matcher::match_documents;
use crate::model::{
    BatchReport, ComparisonResult, Confidence, ExtractedDocument, ExtractionTier, Flow, LedgerRow,
    OverallStatus, ReconMeta, VerificationSummary,
};
use crate::normalize::{country_prefix, normalize_counterparty_id};
use crate::pages::read_source;

/// Match a batch of extracted documents against the ledger and tally the
/// outcome. Deterministic for a given input, apart from `meta.run_at`.
///
/// An empty ledger is allowed here: every document simply ends up
/// `unreadable` or `not_found`.
pub fn verify(
    config: &ReconConfig,
    docs: &[ExtractedDocument],
    rows: &[LedgerRow],
) -> Result<VerificationSummary, ReconError> {
    check_row_indices(rows)?;

    let comparator = Comparator::new(config);
    let outcome = match_documents(docs, rows, &comparator);

    let results: Vec<ComparisonResult> = docs
        .iter()
        .zip(&outcome.assignments)
        .map(|(doc, assignment)| {
            let row = assignment.map(|a| &rows[a.row]);
            let fields = comparator.compare(doc, row);
            let status = match row {
                Some(_) => overall_status(&fields),
                None if doc.confidence == Confidence::Unreadable => OverallStatus::Unreadable,
                None => OverallStatus::NotFound,
            };
            ComparisonResult {
                source_index: doc.source_index,
                file_name: doc.file_name.clone(),
                document_number: doc.document_number.clone(),
                matched_row: row.map(|r| r.row_index),
                pass: assignment.map(|a| a.pass),
                mismatches: mismatch_count(&fields),
                fields,
                status,
            }
        })
        .collect();

    let mut foreign_excluded = 0;
    let missing_rows: Vec<LedgerRow> = rows
        .iter()
        .filter(|r| !outcome.claims.is_claimed(r.row_index))
        .filter(|r| {
            let foreign = config.flow == Flow::Sales && is_foreign(r, &config.domestic_country);
            if foreign {
                foreign_excluded += 1;
            }
            !foreign
        })
        .cloned()
        .collect();

    let totals = compute_totals(&results, rows.len(), missing_rows.len(), foreign_excluded);
    info!(
        documents = totals.documents,
        matched = totals.matched,
        suspicious = totals.suspicious,
        unreadable = totals.unreadable,
        not_found = totals.not_found,
        missing_rows = totals.missing_rows,
        "verification complete"
    );

    Ok(VerificationSummary {
        meta: ReconMeta {
            config_name: config.name.clone(),
            flow: config.flow,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
        },
        totals,
        results,
        missing_rows,
    })
}

fn check_row_indices(rows: &[LedgerRow]) -> Result<(), ReconError> {
    let mut seen = BTreeSet::new();
    for row in rows {
        if !seen.insert(row.row_index) {
            return Err(ReconError::DuplicateRowIndex(row.row_index));
        }
    }
    Ok(())
}

/// A counterparty whose VAT id (or, lacking one, id) carries a country
/// prefix other than the domestic one.
fn is_foreign(row: &LedgerRow, domestic: &str) -> bool {
    let id = row
        .counterparty_vat_id
        .as_deref()
        .or(row.counterparty_id.as_deref())
        .map(normalize_counterparty_id)
        .unwrap_or_default();
    country_prefix(&id).map_or(false, |prefix| !prefix.eq_ignore_ascii_case(domestic))
}

// ---------------------------------------------------------------------------
// Batch pipeline
// ---------------------------------------------------------------------------

/// Full pipeline over raw sources: paced extraction with escalation of
/// unreadable reads, verification, enhanced-tier arbitration of flagged
/// documents, and the ledger consistency check.
pub struct Reconciler<'a> {
    config: &'a ReconConfig,
    service: &'a dyn ExtractionService,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: &'a ReconConfig, service: &'a dyn ExtractionService) -> Self {
        Self { config, service }
    }

    pub async fn run_batch(
        &self,
        sources: &[SourceDocument],
        rows: &[LedgerRow],
    ) -> Result<BatchReport, ReconError> {
        if rows.is_empty() {
            return Err(ReconError::EmptyLedger);
        }
        check_row_indices(rows)?;

        let comparator = Comparator::new(self.config);
        let mut pacer = Pacer::new(self.service, self.config.pacing.clone());

        let mut docs = Vec::with_capacity(sources.len());
        for source in sources {
            let doc =
                read_source(&mut pacer, source, ExtractionTier::Standard, &self.config.pages).await;
            let doc = if doc.confidence == Confidence::Unreadable && !doc.rescan_attempted {
                pacer.stats_mut().escalations += 1;
                info!(file = %source.file_name, "unreadable, escalating to enhanced tier");
                let candidate =
                    read_source(&mut pacer, source, ExtractionTier::Enhanced, &self.config.pages)
                        .await;
                resolve(doc, candidate, None, &comparator)
            } else {
                doc
            };
            docs.push(doc);
        }

        let mut summary = verify(self.config, &docs, rows)?;

        let replaced = arbitrate_flagged(
            &mut docs,
            sources,
            &summary,
            rows,
            &comparator,
            &self.config.pages,
            &mut pacer,
        )
        .await;
        if replaced > 0 {
            // claims may shift once better reads are in
            summary = verify(self.config, &docs, rows)?;
        }

        let stats = pacer.into_stats();
        if stats.exhausted > 0 {
            warn!(
                exhausted = stats.exhausted,
                "documents left unreadable after exhausting retries"
            );
        }

        let findings = check_ledger(rows, self.config);

        Ok(BatchReport {
            summary,
            findings,
            stats,
            documents: docs,
        })
    }
}
