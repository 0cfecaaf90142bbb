//! `tally-recon`: document reconciliation engine.
//!
//! Matches machine-extracted invoices and credit/debit notes against the
//! authoritative rows of an accounting ledger export, and flags every
//! disagreement for human review.
//!
//! Pure engine crate: the extraction service sits behind the
//! [`extract::ExtractionService`] trait, ledger rows arrive pre-parsed.
//! No CLI or file IO dependencies.

pub mod arbitrate;
pub mod compare;
pub mod config;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod extract;
pub mod ledger_check;
pub mod matcher;
pub mod model;
pub mod normalize;
pub mod pages;

pub use config::ReconConfig;
pub use engine::{verify, Reconciler};
pub use error::ReconError;
pub use extract::{ExtractionError, ExtractionService, PageSelector, SourceDocument};
pub use model::{
    BatchReport, ComparisonResult, Confidence, ExtractedDocument, Flow, LedgerRow, OverallStatus,
    VerificationSummary,
};
