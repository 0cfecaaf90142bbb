use crate::config::PageConfig;
use crate::extract::{Pacer, PageSelector, SourceDocument};
use crate::model::{ExtractedDocument, ExtractionMethod, ExtractionTier};

/// Read one source with the given tier. Multi-page sources are read as
/// first and last page, then merged.
pub async fn read_source(
    pacer: &mut Pacer<'_>,
    source: &SourceDocument,
    tier: ExtractionTier,
    config: &PageConfig,
) -> ExtractedDocument {
    if !source.is_multi_page() {
        return pacer.extract(source, PageSelector::Whole, tier).await;
    }
    let first = pacer.extract(source, PageSelector::First, tier).await;
    let last = pacer.extract(source, PageSelector::Last, tier).await;
    merge_pages(&first, &last, config)
}

/// Combine first-page and last-page extractions of one source document.
///
/// Metadata comes from the first page, with the last page filling its
/// gaps. Totals come from the page whose VAT/base ratio is plausible for
/// the standard rate; when both or neither are, the larger base wins, since
/// a grand total is never smaller than a page subtotal.
pub fn merge_pages(
    first: &ExtractedDocument,
    last: &ExtractedDocument,
    config: &PageConfig,
) -> ExtractedDocument {
    let amounts_from_last = match (first.tax_base, last.tax_base) {
        (Some(_), None) => false,
        (None, Some(_)) => true,
        (None, None) => false,
        (Some(first_base), Some(last_base)) => {
            match (plausible_ratio(first, config), plausible_ratio(last, config)) {
                (true, false) => false,
                (false, true) => true,
                _ => last_base.abs() > first_base.abs(),
            }
        }
    };
    let totals = if amounts_from_last { last } else { first };

    let mut contributors = Vec::with_capacity(2);
    if has_metadata(first) || (!amounts_from_last && first.tax_base.is_some()) {
        contributors.push(first.confidence);
    }
    let last_fills_gap = (first.document_type.is_none() && last.document_type.is_some())
        || (first.document_number.is_none() && last.document_number.is_some())
        || (first.document_date.is_none() && last.document_date.is_some())
        || (first.counterparty_id.is_none() && last.counterparty_id.is_some())
        || (first.counterparty_vat_id.is_none() && last.counterparty_vat_id.is_some());
    if last_fills_gap || (amounts_from_last && last.tax_base.is_some()) {
        contributors.push(last.confidence);
    }
    let confidence = contributors
        .into_iter()
        .min()
        .unwrap_or_else(|| first.confidence.min(last.confidence));

    let method = if first.method == ExtractionMethod::Ocr || last.method == ExtractionMethod::Ocr {
        ExtractionMethod::Ocr
    } else {
        ExtractionMethod::NativeText
    };

    ExtractedDocument {
        source_index: first.source_index,
        file_name: first.file_name.clone(),
        document_type: first.document_type.clone().or_else(|| last.document_type.clone()),
        document_number: first
            .document_number
            .clone()
            .or_else(|| last.document_number.clone()),
        document_date: first.document_date.clone().or_else(|| last.document_date.clone()),
        counterparty_id: first
            .counterparty_id
            .clone()
            .or_else(|| last.counterparty_id.clone()),
        counterparty_vat_id: first
            .counterparty_vat_id
            .clone()
            .or_else(|| last.counterparty_vat_id.clone()),
        tax_base: totals.tax_base,
        vat: totals.vat,
        confidence,
        method,
        rescan_attempted: first.rescan_attempted || last.rescan_attempted,
        rescan_used: first.rescan_used || last.rescan_used,
    }
}

fn has_metadata(page: &ExtractedDocument) -> bool {
    page.document_type.is_some()
        || page.document_number.is_some()
        || page.document_date.is_some()
        || page.counterparty_id.is_some()
        || page.counterparty_vat_id.is_some()
}

/// VAT/base within `ratio_tolerance` of the standard rate.
fn plausible_ratio(page: &ExtractedDocument, config: &PageConfig) -> bool {
    match (page.tax_base, page.vat) {
        (Some(base), Some(vat)) if base.abs() >= 0.01 => {
            ((vat / base).abs() - config.standard_vat_rate).abs() <= config.ratio_tolerance
        }
        _ => false,
    }
}
