use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::normalize::{serde_amount, serde_text};

// ---------------------------------------------------------------------------
// Extraction side
// ---------------------------------------------------------------------------

/// How sure the extractor is about a record. Declaration order is the
/// ordinal: `Unreadable < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Unreadable,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreadable => "unreadable",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the extractor got its text from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    NativeText,
    Ocr,
}

impl Default for ExtractionMethod {
    fn default() -> Self {
        Self::Ocr
    }
}

/// Extraction service tier. `Enhanced` is slower, costlier and only used
/// for escalation and arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    Standard,
    Enhanced,
}

impl std::fmt::Display for ExtractionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Enhanced => write!(f, "enhanced"),
        }
    }
}

/// One candidate document read from a source file (or one page of it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    #[serde(default)]
    pub source_index: usize,
    #[serde(default)]
    pub file_name: String,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub document_type: Option<String>,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub document_number: Option<String>,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub document_date: Option<String>,
    /// Supplier for purchases, client for sales.
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub counterparty_id: Option<String>,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub counterparty_vat_id: Option<String>,
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub tax_base: Option<f64>,
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub vat: Option<f64>,
    pub confidence: Confidence,
    #[serde(default)]
    pub method: ExtractionMethod,
    /// An enhanced-tier re-extraction was run for this document.
    #[serde(default)]
    pub rescan_attempted: bool,
    /// The enhanced-tier record replaced the original.
    #[serde(default)]
    pub rescan_used: bool,
}

impl ExtractedDocument {
    /// Placeholder for a source whose extraction failed outright.
    pub fn unreadable(source_index: usize, file_name: impl Into<String>) -> Self {
        Self {
            source_index,
            file_name: file_name.into(),
            document_type: None,
            document_number: None,
            document_date: None,
            counterparty_id: None,
            counterparty_vat_id: None,
            tax_base: None,
            vat: None,
            confidence: Confidence::Unreadable,
            method: ExtractionMethod::Ocr,
            rescan_attempted: false,
            rescan_used: false,
        }
    }

    /// Number of populated data fields (flags and identity excluded).
    pub fn filled_fields(&self) -> usize {
        [
            self.document_type.is_some(),
            self.document_number.is_some(),
            self.document_date.is_some(),
            self.counterparty_id.is_some(),
            self.counterparty_vat_id.is_some(),
            self.tax_base.is_some(),
            self.vat.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

// ---------------------------------------------------------------------------
// Ledger side
// ---------------------------------------------------------------------------

/// Amount columns of a ledger row. Which ones apply depends on the flow and
/// on the counterparty's VAT registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerAmounts {
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub total_base: Option<f64>,
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub total_vat: Option<f64>,
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub base_20: Option<f64>,
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub vat_20: Option<f64>,
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub base_9: Option<f64>,
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub vat_9: Option<f64>,
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub base_0: Option<f64>,
    /// Purchases without right of tax credit (non-registered suppliers).
    #[serde(default, deserialize_with = "serde_amount::deserialize")]
    pub base_no_credit: Option<f64>,
}

impl LedgerAmounts {
    fn bucket_base_sum(&self) -> Option<f64> {
        sum_present(&[self.base_20, self.base_9, self.base_0])
    }

    fn bucket_vat_sum(&self) -> Option<f64> {
        sum_present(&[self.vat_20, self.vat_9])
    }
}

/// Sum the present values; `None` when none are present.
pub(crate) fn sum_present(values: &[Option<f64>]) -> Option<f64> {
    values
        .iter()
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

/// One authoritative row of the accounting export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    /// 1-based position in the source table; the unit of claim exclusivity.
    pub row_index: usize,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub document_type: Option<String>,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub document_number: Option<String>,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub document_date: Option<String>,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub counterparty_id: Option<String>,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub counterparty_vat_id: Option<String>,
    #[serde(default, deserialize_with = "serde_text::deserialize")]
    pub counterparty_name: Option<String>,
    #[serde(default = "default_true")]
    pub vat_registered: bool,
    #[serde(default)]
    pub amounts: LedgerAmounts,
}

fn default_true() -> bool {
    true
}

impl LedgerRow {
    pub fn new(row_index: usize) -> Self {
        Self {
            row_index,
            document_type: None,
            document_number: None,
            document_date: None,
            counterparty_id: None,
            counterparty_vat_id: None,
            counterparty_name: None,
            vat_registered: true,
            amounts: LedgerAmounts::default(),
        }
    }

    /// The (tax base, VAT) pair an extracted document is compared against.
    ///
    /// Purchases: registered counterparties book into the credit columns,
    /// non-registered ones into `base_no_credit` with zero VAT.
    /// Sales: the single non-zero rate bucket (20%, 9%, 0%). A row with
    /// several non-zero buckets, or none, uses the total columns.
    pub fn applicable_amounts(&self, flow: Flow) -> (Option<f64>, Option<f64>) {
        let a = &self.amounts;
        match flow {
            Flow::Purchase if !self.vat_registered => {
                (a.base_no_credit.or(a.total_base), Some(0.0))
            }
            Flow::Purchase => (
                a.total_base.or_else(|| a.bucket_base_sum()),
                a.total_vat.or_else(|| a.bucket_vat_sum()),
            ),
            Flow::Sales => {
                let nonzero = |v: Option<f64>| v.map_or(false, |x| x.abs() >= 0.005);
                let buckets = [
                    (a.base_20, a.vat_20),
                    (a.base_9, a.vat_9),
                    (a.base_0, Some(0.0)),
                ];
                let mut used = buckets.iter().filter(|(base, _)| nonzero(*base));
                match (used.next(), used.next()) {
                    (Some(&(base, vat)), None) => (base, vat),
                    // mixed-rate or bucketless rows compare against totals
                    _ => (
                        a.total_base.or_else(|| a.bucket_base_sum()),
                        a.total_vat.or_else(|| a.bucket_vat_sum()),
                    ),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Flow + fields
// ---------------------------------------------------------------------------

/// Which journal is being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Purchase,
    Sales,
}

impl Flow {
    /// Fields compared for this flow, in report order.
    pub fn fields(&self) -> &'static [FieldId] {
        match self {
            Self::Purchase => &[
                FieldId::DocumentType,
                FieldId::DocumentNumber,
                FieldId::DocumentDate,
                FieldId::CounterpartyId,
                FieldId::TaxBase,
                FieldId::Vat,
            ],
            Self::Sales => &[
                FieldId::DocumentType,
                FieldId::DocumentNumber,
                FieldId::DocumentDate,
                FieldId::CounterpartyId,
                FieldId::CounterpartyVatId,
                FieldId::TaxBase,
                FieldId::Vat,
            ],
        }
    }
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Purchase => write!(f, "purchase"),
            Self::Sales => write!(f, "sales"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldId {
    DocumentType,
    DocumentNumber,
    DocumentDate,
    CounterpartyId,
    CounterpartyVatId,
    TaxBase,
    Vat,
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentType => write!(f, "document_type"),
            Self::DocumentNumber => write!(f, "document_number"),
            Self::DocumentDate => write!(f, "document_date"),
            Self::CounterpartyId => write!(f, "counterparty_id"),
            Self::CounterpartyVatId => write!(f, "counterparty_vat_id"),
            Self::TaxBase => write!(f, "tax_base"),
            Self::Vat => write!(f, "vat"),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Match,
    Suspicious,
    Missing,
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldComparison {
    pub field: FieldId,
    pub extracted: Option<String>,
    pub ledger: Option<String>,
    pub status: FieldStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Match,
    Suspicious,
    Unreadable,
    NotFound,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Suspicious => "suspicious",
            Self::Unreadable => "unreadable",
            Self::NotFound => "not_found",
        }
    }

    /// Needs a human (or an arbitration pass) to look at it.
    pub fn is_flagged(&self) -> bool {
        !matches!(self, Self::Match)
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which matching pass produced a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPass {
    ExactKey,
    BestMatch,
}

/// One extracted document's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub source_index: usize,
    pub file_name: String,
    pub document_number: Option<String>,
    pub matched_row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<MatchPass>,
    pub mismatches: usize,
    pub fields: Vec<FieldComparison>,
    pub status: OverallStatus,
}

// ---------------------------------------------------------------------------
// Summary + Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ReconMeta {
    pub config_name: String,
    pub flow: Flow,
    pub engine_version: String,
    pub run_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationTotals {
    pub documents: usize,
    pub ledger_rows: usize,
    pub matched: usize,
    pub suspicious: usize,
    pub unreadable: usize,
    pub not_found: usize,
    pub missing_rows: usize,
    /// Unclaimed foreign rows left out of `missing_rows` (sales flow).
    pub foreign_rows_excluded: usize,
    pub status_counts: BTreeMap<String, usize>,
}

/// The batch result of one verification run.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationSummary {
    pub meta: ReconMeta,
    pub totals: VerificationTotals,
    pub results: Vec<ComparisonResult>,
    pub missing_rows: Vec<LedgerRow>,
}

impl VerificationSummary {
    /// Result for the document at `source_index`, if it was part of the run.
    pub fn result_for(&self, source_index: usize) -> Option<&ComparisonResult> {
        self.results.iter().find(|r| r.source_index == source_index)
    }

    pub fn has_discrepancies(&self) -> bool {
        self.totals.suspicious + self.totals.unreadable + self.totals.not_found > 0
            || self.totals.missing_rows > 0
    }
}

// ---------------------------------------------------------------------------
// Ledger consistency findings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingRule {
    /// Total tax base column differs from the sum of its rate buckets.
    TotalBase,
    /// Total VAT column differs from the sum of its rate buckets.
    TotalVat,
    /// VAT in a rate bucket differs from base × rate.
    VatRate,
    SequenceGap,
    DuplicateNumber,
    DateOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerFinding {
    pub severity: Severity,
    pub rule: FindingRule,
    pub row_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Batch pipeline output
// ---------------------------------------------------------------------------

/// Aggregate counters for the extraction side of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStats {
    pub calls: usize,
    pub transient_retries: usize,
    /// Documents turned unreadable because retries ran out.
    pub exhausted: usize,
    pub failed: usize,
    pub escalations: usize,
    pub arbitrations: usize,
    pub replacements: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub summary: VerificationSummary,
    pub findings: Vec<LedgerFinding>,
    pub stats: ExtractionStats,
    pub documents: Vec<ExtractedDocument>,
}
