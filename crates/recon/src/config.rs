use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ReconError;
use crate::model::{Flow, OverallStatus};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ReconConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub flow: Flow,
    /// Country prefix of domestic VAT ids; other prefixes are foreign.
    #[serde(default = "default_country")]
    pub domestic_country: String,
    #[serde(default)]
    pub tolerance: ToleranceConfig,
    #[serde(default)]
    pub pages: PageConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub ledger_checks: LedgerCheckConfig,
    /// Extra ledger type codes → accepted document-type variants.
    #[serde(default)]
    pub type_codes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub ledger_columns: Option<LedgerColumns>,
}

fn default_name() -> String {
    "reconciliation".into()
}

fn default_country() -> String {
    "BG".into()
}

// ---------------------------------------------------------------------------
// Tolerance
// ---------------------------------------------------------------------------

/// Matching policy as written in the file. Omitted keys take the flow's
/// defaults (see [`Tolerances::for_flow`]).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToleranceConfig {
    #[serde(default)]
    pub tax_base: Option<f64>,
    #[serde(default)]
    pub vat: Option<f64>,
    #[serde(default)]
    pub mismatch_ceiling: Option<usize>,
}

/// Resolved matching policy.
///
/// Amounts match when `|a - b| < tolerance` (strict). A best-match
/// candidate is rejected when its mismatch count is `>= mismatch_ceiling`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub tax_base: f64,
    pub vat: f64,
    pub mismatch_ceiling: usize,
}

impl Tolerances {
    pub fn for_flow(flow: Flow) -> Self {
        match flow {
            Flow::Purchase => Self {
                tax_base: 0.03,
                vat: 0.02,
                mismatch_ceiling: 3,
            },
            Flow::Sales => Self {
                tax_base: 0.03,
                vat: 0.005,
                mismatch_ceiling: 4,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Page merging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PageConfig {
    #[serde(default = "default_standard_rate")]
    pub standard_vat_rate: f64,
    /// Allowed distance of VAT/base from the standard rate (0.05 = ±5 pp).
    #[serde(default = "default_ratio_tolerance")]
    pub ratio_tolerance: f64,
}

fn default_standard_rate() -> f64 {
    0.20
}

fn default_ratio_tolerance() -> f64 {
    0.05
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            standard_vat_rate: default_standard_rate(),
            ratio_tolerance: default_ratio_tolerance(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

/// Pacing of calls to the rate-limited extraction service.
#[derive(Debug, Clone, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,
    #[serde(default = "default_escalation_delay")]
    pub escalation_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

fn default_request_delay() -> u64 {
    1500
}

fn default_escalation_delay() -> u64 {
    3000
}

fn default_max_retries() -> u32 {
    4
}

fn default_backoff_base() -> u64 {
    2000
}

fn default_backoff_max() -> u64 {
    60_000
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            request_delay_ms: default_request_delay(),
            escalation_delay_ms: default_escalation_delay(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl PacingConfig {
    /// Same retry ceiling, no waiting. For replayed extractions and tests.
    pub fn without_delays(&self) -> Self {
        Self {
            request_delay_ms: 0,
            escalation_delay_ms: 0,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            ..self.clone()
        }
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn escalation_delay(&self) -> Duration {
        Duration::from_millis(self.escalation_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Ledger checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerCheckConfig {
    #[serde(default = "default_check_tolerance")]
    pub amount_tolerance: f64,
    /// Rates of the standard and reduced buckets, in that order.
    #[serde(default = "default_vat_rates")]
    pub vat_rates: Vec<f64>,
    /// Number-sequence and date-order checks. Defaults to on for sales
    /// (our own numbering) and off for purchases (many issuers).
    #[serde(default)]
    pub sequence: Option<bool>,
}

fn default_check_tolerance() -> f64 {
    0.02
}

fn default_vat_rates() -> Vec<f64> {
    vec![0.20, 0.09]
}

impl Default for LedgerCheckConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: default_check_tolerance(),
            vat_rates: default_vat_rates(),
            sequence: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Export labels
// ---------------------------------------------------------------------------

/// Human-readable label written back next to each ledger row.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelConfig {
    #[serde(rename = "match", default = "default_match_label")]
    pub matched: String,
    #[serde(default = "default_suspicious_label")]
    pub suspicious: String,
    #[serde(default = "default_unreadable_label")]
    pub unreadable: String,
    #[serde(default = "default_not_found_label")]
    pub not_found: String,
    /// For ledger rows no document claimed.
    #[serde(default = "default_missing_label")]
    pub missing: String,
}

fn default_match_label() -> String {
    "OK".into()
}

fn default_suspicious_label() -> String {
    "CHECK".into()
}

fn default_unreadable_label() -> String {
    "UNREADABLE".into()
}

fn default_not_found_label() -> String {
    "NOT FOUND".into()
}

fn default_missing_label() -> String {
    "MISSING DOCUMENT".into()
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            matched: default_match_label(),
            suspicious: default_suspicious_label(),
            unreadable: default_unreadable_label(),
            not_found: default_not_found_label(),
            missing: default_missing_label(),
        }
    }
}

impl LabelConfig {
    pub fn for_status(&self, status: OverallStatus) -> &str {
        match status {
            OverallStatus::Match => &self.matched,
            OverallStatus::Suspicious => &self.suspicious,
            OverallStatus::Unreadable => &self.unreadable,
            OverallStatus::NotFound => &self.not_found,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger column mapping
// ---------------------------------------------------------------------------

/// Header names of the ledger export, for loaders that read tables.
/// Unmapped columns load as `None`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerColumns {
    pub document_number: String,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub document_date: Option<String>,
    #[serde(default)]
    pub counterparty_id: Option<String>,
    #[serde(default)]
    pub counterparty_vat_id: Option<String>,
    #[serde(default)]
    pub counterparty_name: Option<String>,
    #[serde(default)]
    pub vat_registered: Option<String>,
    #[serde(default)]
    pub total_base: Option<String>,
    #[serde(default)]
    pub total_vat: Option<String>,
    #[serde(default)]
    pub base_20: Option<String>,
    #[serde(default)]
    pub vat_20: Option<String>,
    #[serde(default)]
    pub base_9: Option<String>,
    #[serde(default)]
    pub vat_9: Option<String>,
    #[serde(default)]
    pub base_0: Option<String>,
    #[serde(default)]
    pub base_no_credit: Option<String>,
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ReconConfig {
    /// All defaults for a flow; what an empty file with only `flow` gives.
    pub fn for_flow(flow: Flow) -> Self {
        Self {
            name: default_name(),
            flow,
            domestic_country: default_country(),
            tolerance: ToleranceConfig::default(),
            pages: PageConfig::default(),
            pacing: PacingConfig::default(),
            ledger_checks: LedgerCheckConfig::default(),
            type_codes: BTreeMap::new(),
            labels: LabelConfig::default(),
            ledger_columns: None,
        }
    }

    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let config: ReconConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Effective matching policy: file values over flow defaults.
    pub fn tolerances(&self) -> Tolerances {
        let defaults = Tolerances::for_flow(self.flow);
        Tolerances {
            tax_base: self.tolerance.tax_base.unwrap_or(defaults.tax_base),
            vat: self.tolerance.vat.unwrap_or(defaults.vat),
            mismatch_ceiling: self
                .tolerance
                .mismatch_ceiling
                .unwrap_or(defaults.mismatch_ceiling),
        }
    }

    pub fn sequence_checks(&self) -> bool {
        self.ledger_checks
            .sequence
            .unwrap_or(self.flow == Flow::Sales)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        let tol = self.tolerances();
        for (key, value) in [("tax_base", tol.tax_base), ("vat", tol.vat)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ReconError::ConfigValidation(format!(
                    "tolerance.{key} must be a positive number, got {value}"
                )));
            }
        }
        if tol.mismatch_ceiling == 0 {
            return Err(ReconError::ConfigValidation(
                "tolerance.mismatch_ceiling must be at least 1".into(),
            ));
        }

        let country = &self.domestic_country;
        if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ReconError::ConfigValidation(format!(
                "domestic_country must be a two-letter uppercase code, got '{country}'"
            )));
        }

        let rate = self.pages.standard_vat_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(ReconError::ConfigValidation(format!(
                "pages.standard_vat_rate must be between 0 and 1, got {rate}"
            )));
        }
        if !self.pages.ratio_tolerance.is_finite() || self.pages.ratio_tolerance < 0.0 {
            return Err(ReconError::ConfigValidation(
                "pages.ratio_tolerance must not be negative".into(),
            ));
        }

        if self.pacing.backoff_base_ms > self.pacing.backoff_max_ms {
            return Err(ReconError::ConfigValidation(format!(
                "pacing.backoff_base_ms ({}) exceeds pacing.backoff_max_ms ({})",
                self.pacing.backoff_base_ms, self.pacing.backoff_max_ms
            )));
        }

        let checks = &self.ledger_checks;
        if !checks.amount_tolerance.is_finite() || checks.amount_tolerance <= 0.0 {
            return Err(ReconError::ConfigValidation(
                "ledger_checks.amount_tolerance must be a positive number".into(),
            ));
        }
        if let Some(bad) = checks.vat_rates.iter().find(|r| !(**r > 0.0 && **r < 1.0)) {
            return Err(ReconError::ConfigValidation(format!(
                "ledger_checks.vat_rates must be between 0 and 1, got {bad}"
            )));
        }
        if checks.vat_rates.len() != 2 {
            return Err(ReconError::ConfigValidation(format!(
                "ledger_checks.vat_rates needs the standard and reduced rate, got {} values",
                checks.vat_rates.len()
            )));
        }

        for (code, variants) in &self.type_codes {
            if variants.iter().all(|v| v.trim().is_empty()) {
                return Err(ReconError::ConfigValidation(format!(
                    "type_codes.'{code}' needs at least one non-empty variant"
                )));
            }
        }

        let labels = &self.labels;
        for (key, label) in [
            ("match", &labels.matched),
            ("suspicious", &labels.suspicious),
            ("unreadable", &labels.unreadable),
            ("not_found", &labels.not_found),
            ("missing", &labels.missing),
        ] {
            if label.trim().is_empty() {
                return Err(ReconError::ConfigValidation(format!(
                    "labels.{key} must not be empty"
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PURCHASES: &str = r#"
name = "Purchases 2024-03"
flow = "purchase"

[tolerance]
tax_base = 0.05

[pacing]
request_delay_ms = 0
max_retries = 2

[type_codes]
"ПР" = ["ПРОТОКОЛ"]

[labels]
match = "Съвпада"
"#;

    #[test]
    fn parse_with_partial_overrides() {
        let config = ReconConfig::from_toml(PURCHASES).unwrap();
        assert_eq!(config.name, "Purchases 2024-03");
        assert_eq!(config.flow, Flow::Purchase);
        assert_eq!(config.domestic_country, "BG");

        let tol = config.tolerances();
        assert_eq!(tol.tax_base, 0.05);
        assert_eq!(tol.vat, 0.02);
        assert_eq!(tol.mismatch_ceiling, 3);

        assert_eq!(config.pacing.request_delay_ms, 0);
        assert_eq!(config.pacing.escalation_delay_ms, 3000);
        assert_eq!(config.pacing.max_retries, 2);
        assert_eq!(config.type_codes["ПР"], vec!["ПРОТОКОЛ"]);
        assert_eq!(config.labels.for_status(OverallStatus::Match), "Съвпада");
        assert_eq!(config.labels.for_status(OverallStatus::NotFound), "NOT FOUND");
        assert!(!config.sequence_checks());
    }

    #[test]
    fn sales_defaults() {
        let config = ReconConfig::from_toml("flow = \"sales\"").unwrap();
        let tol = config.tolerances();
        assert_eq!(tol.vat, 0.005);
        assert_eq!(tol.mismatch_ceiling, 4);
        assert!(config.sequence_checks());
        assert_eq!(config.ledger_checks.vat_rates, vec![0.20, 0.09]);
        assert_eq!(config.pages.standard_vat_rate, 0.20);
    }

    #[test]
    fn purchase_ceiling_stricter_than_sales() {
        assert!(
            Tolerances::for_flow(Flow::Purchase).mismatch_ceiling
                < Tolerances::for_flow(Flow::Sales).mismatch_ceiling
        );
    }

    #[test]
    fn ledger_columns_mapping() {
        let input = r#"
flow = "sales"

[ledger_columns]
document_number = "Doc No"
document_date = "Date"
base_20 = "Base 20%"
"#;
        let config = ReconConfig::from_toml(input).unwrap();
        let cols = config.ledger_columns.unwrap();
        assert_eq!(cols.document_number, "Doc No");
        assert_eq!(cols.base_20.as_deref(), Some("Base 20%"));
        assert!(cols.vat_20.is_none());
    }

    #[test]
    fn without_delays_keeps_retry_ceiling() {
        let pacing = PacingConfig::default().without_delays();
        assert_eq!(pacing.request_delay(), Duration::ZERO);
        assert_eq!(pacing.escalation_delay(), Duration::ZERO);
        assert_eq!(pacing.max_retries, 4);
    }

    #[test]
    fn reject_unknown_flow() {
        let err = ReconConfig::from_toml("flow = \"payroll\"").unwrap_err();
        assert!(matches!(err, ReconError::ConfigParse(_)));
    }

    #[test]
    fn reject_zero_tolerance() {
        let err = ReconConfig::from_toml("flow = \"sales\"\n[tolerance]\nvat = 0.0\n").unwrap_err();
        assert!(err.to_string().contains("tolerance.vat"));
    }

    #[test]
    fn reject_zero_ceiling() {
        let err = ReconConfig::from_toml("flow = \"sales\"\n[tolerance]\nmismatch_ceiling = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("mismatch_ceiling"));
    }

    #[test]
    fn reject_bad_vat_rate() {
        let err = ReconConfig::from_toml("flow = \"sales\"\n[ledger_checks]\nvat_rates = [20.0]\n")
            .unwrap_err();
        assert!(err.to_string().contains("vat_rates"));
    }

    #[test]
    fn reject_empty_label() {
        let err =
            ReconConfig::from_toml("flow = \"sales\"\n[labels]\nmissing = \" \"\n").unwrap_err();
        assert!(err.to_string().contains("labels.missing"));
    }

    #[test]
    fn reject_bad_country() {
        let err =
            ReconConfig::from_toml("flow = \"sales\"\ndomestic_country = \"bg\"\n").unwrap_err();
        assert!(err.to_string().contains("domestic_country"));
    }
}
