use thiserror::Error;

/// Structural failures that abort a whole batch.
///
/// Per-document problems never surface here: an illegible scan is an
/// `unreadable` confidence, a document without a ledger row is `not_found`.
#[derive(Debug, Error)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Config validation error (bad tolerance, empty label, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// The ledger had no parseable rows at all.
    #[error("ledger has no parseable rows")]
    EmptyLedger,

    /// Two ledger rows share a row index, so claims cannot be exclusive.
    #[error("duplicate ledger row index {0}")]
    DuplicateRowIndex(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(ReconError::EmptyLedger.to_string(), "ledger has no parseable rows");
        assert_eq!(
            ReconError::DuplicateRowIndex(7).to_string(),
            "duplicate ledger row index 7"
        );
        assert!(ReconError::ConfigParse("x".into()).to_string().contains("parse"));
    }
}
