use std::cmp::Ordering;

use tracing::info;

use crate::compare::Comparator;
use crate::config::PageConfig;
use crate::extract::{Pacer, SourceDocument};
use crate::model::{
    Confidence, ExtractedDocument, ExtractionTier, LedgerRow, OverallStatus, VerificationSummary,
};
use crate::pages::read_source;

/// A document earns one enhanced re-extraction when it is unreadable or
/// flagged by verification, unless it already had one.
pub fn needs_arbitration(doc: &ExtractedDocument, status: Option<OverallStatus>) -> bool {
    !doc.rescan_attempted
        && (doc.confidence == Confidence::Unreadable || status.map_or(false, |s| s.is_flagged()))
}

/// True when `candidate` should replace `original`.
///
/// With a matched row, fewer mismatches against it decides. Otherwise (or
/// on a tie) higher confidence, then more populated fields. A full tie
/// keeps the original.
pub fn prefer_candidate(
    original: &ExtractedDocument,
    candidate: &ExtractedDocument,
    row: Option<&LedgerRow>,
    comparator: &Comparator,
) -> bool {
    let by_ground_truth = row.map_or(Ordering::Equal, |row| {
        // fewer is better, so compare original against candidate
        comparator
            .mismatch_count(original, row)
            .cmp(&comparator.mismatch_count(candidate, row))
    });
    by_ground_truth
        .then_with(|| candidate.confidence.cmp(&original.confidence))
        .then_with(|| candidate.filled_fields().cmp(&original.filled_fields()))
        == Ordering::Greater
}

/// Pick between the two reads and mark the survivor as double-checked.
pub fn resolve(
    original: ExtractedDocument,
    candidate: ExtractedDocument,
    row: Option<&LedgerRow>,
    comparator: &Comparator,
) -> ExtractedDocument {
    let replace = prefer_candidate(&original, &candidate, row, comparator);
    let mut chosen = if replace { candidate } else { original };
    chosen.rescan_attempted = true;
    chosen.rescan_used = replace;
    chosen
}

/// Re-extract every flagged document with the enhanced tier and keep the
/// better read. Returns how many documents were replaced.
///
/// `docs`, `sources` and `summary.results` are aligned by position.
pub async fn arbitrate_flagged(
    docs: &mut [ExtractedDocument],
    sources: &[SourceDocument],
    summary: &VerificationSummary,
    rows: &[LedgerRow],
    comparator: &Comparator,
    pages: &PageConfig,
    pacer: &mut Pacer<'_>,
) -> usize {
    let mut replaced = 0;
    for (i, (doc, source)) in docs.iter_mut().zip(sources).enumerate() {
        let result = summary.results.get(i);
        if !needs_arbitration(doc, result.map(|r| r.status)) {
            continue;
        }
        let row = result
            .and_then(|r| r.matched_row)
            .and_then(|idx| rows.iter().find(|row| row.row_index == idx));

        pacer.stats_mut().arbitrations += 1;
        let candidate = read_source(pacer, source, ExtractionTier::Enhanced, pages).await;
        let original = std::mem::replace(doc, ExtractedDocument::unreadable(source.index, ""));
        *doc = resolve(original, candidate, row, comparator);

        if doc.rescan_used {
            replaced += 1;
            pacer.stats_mut().replacements += 1;
            info!(
                file = %doc.file_name,
                confidence = %doc.confidence,
                "enhanced read replaced original"
            );
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconConfig;
    use crate::model::Flow;

    fn comparator() -> Comparator {
        Comparator::new(&ReconConfig::for_flow(Flow::Purchase))
    }

    fn row() -> LedgerRow {
        let mut r = LedgerRow::new(1);
        r.document_type = Some("Ф-ра".into());
        r.document_number = Some("55".into());
        r.document_date = Some("10.01.2024".into());
        r.counterparty_id = Some("200300400".into());
        r.amounts.total_base = Some(500.0);
        r.amounts.total_vat = Some(100.0);
        r
    }

    fn read(confidence: Confidence, base: f64) -> ExtractedDocument {
        let mut d = ExtractedDocument::unreadable(0, "a.pdf");
        d.document_type = Some("ФАКТУРА".into());
        d.document_number = Some("55".into());
        d.document_date = Some("10.01.2024".into());
        d.counterparty_id = Some("200300400".into());
        d.tax_base = Some(base);
        d.vat = Some(100.0);
        d.confidence = confidence;
        d
    }

    #[test]
    fn ground_truth_beats_confidence() {
        let original = read(Confidence::Low, 500.0);
        let candidate = read(Confidence::High, 5000.0);
        assert!(!prefer_candidate(&original, &candidate, Some(&row()), &comparator()));
        assert!(prefer_candidate(&candidate, &original, Some(&row()), &comparator()));
    }

    #[test]
    fn confidence_breaks_mismatch_tie() {
        let original = read(Confidence::Low, 500.0);
        let candidate = read(Confidence::Medium, 500.0);
        assert!(prefer_candidate(&original, &candidate, Some(&row()), &comparator()));
    }

    #[test]
    fn filled_fields_break_confidence_tie() {
        let mut original = read(Confidence::Low, 500.0);
        original.document_date = None;
        let candidate = read(Confidence::Low, 500.0);
        assert!(prefer_candidate(&original, &candidate, None, &comparator()));
    }

    #[test]
    fn full_tie_keeps_original() {
        let original = read(Confidence::Medium, 500.0);
        let candidate = read(Confidence::Medium, 500.0);
        let chosen = resolve(original, candidate, Some(&row()), &comparator());
        assert!(chosen.rescan_attempted);
        assert!(!chosen.rescan_used);
    }

    #[test]
    fn resolve_marks_replacement() {
        let original = ExtractedDocument::unreadable(0, "a.pdf");
        let candidate = read(Confidence::Medium, 500.0);
        let chosen = resolve(original, candidate, None, &comparator());
        assert_eq!(chosen.confidence, Confidence::Medium);
        assert!(chosen.rescan_attempted && chosen.rescan_used);
    }

    #[tokio::test]
    async fn arbitration_follows_position_not_source_index() {
        use crate::extract::testing::{fast_pacing, source, ScriptedService};
        use crate::extract::PageSelector;

        let config = ReconConfig::for_flow(Flow::Purchase);
        let mut second_row = row();
        second_row.row_index = 2;
        second_row.document_number = Some("56".into());
        let rows = [row(), second_row];

        // both reads carry the default source index
        let clean = read(Confidence::High, 500.0);
        let mut off = read(Confidence::Medium, 900.0);
        off.document_number = Some("56".into());
        let mut docs = vec![clean, off];

        let summary = crate::engine::verify(&config, &docs, &rows).unwrap();
        assert!(!summary.results[0].status.is_flagged());
        assert!(summary.results[1].status.is_flagged());

        let service = ScriptedService::default();
        let mut fixed = read(Confidence::High, 500.0);
        fixed.document_number = Some("56".into());
        service.reply(1, PageSelector::Whole, ExtractionTier::Enhanced, Ok(fixed));
        let sources = [source(0, 1), source(1, 1)];
        let mut pacer = Pacer::new(&service, fast_pacing());

        let replaced = arbitrate_flagged(
            &mut docs,
            &sources,
            &summary,
            &rows,
            &comparator(),
            &config.pages,
            &mut pacer,
        )
        .await;

        assert_eq!(replaced, 1);
        assert_eq!(pacer.stats().arbitrations, 1);
        assert_eq!(
            *service.calls.lock().unwrap(),
            vec![(1, PageSelector::Whole, ExtractionTier::Enhanced)]
        );
        assert!(!docs[0].rescan_attempted);
        assert_eq!(docs[1].tax_base, Some(500.0));
    }

    #[test]
    fn arbitration_eligibility() {
        let mut doc = read(Confidence::High, 500.0);
        assert!(!needs_arbitration(&doc, Some(OverallStatus::Match)));
        assert!(needs_arbitration(&doc, Some(OverallStatus::NotFound)));
        doc.confidence = Confidence::Unreadable;
        assert!(needs_arbitration(&doc, None));
        doc.rescan_attempted = true;
        assert!(!needs_arbitration(&doc, Some(OverallStatus::Suspicious)));
    }
}
