//! Replay of recorded extraction-service responses.
//!
//! A recording lists the source files of a batch and, per tier and page
//! selection, what the service answered. Replaying it drives the full
//! pipeline (escalation, arbitration, retries) without a live service,
//! which is how batches are re-audited and how the CLI is tested.
//!
//! ```json
//! [
//!   {
//!     "file_name": "1201.pdf",
//!     "page_count": 2,
//!     "standard": {
//!       "first": [{ "error": "rate_limited", "retry_after_secs": 5 }, { "confidence": "high", ... }],
//!       "last": { "confidence": "medium", ... }
//!     },
//!     "enhanced": { "first": { "error": "failed", "message": "timeout" } }
//!   }
//! ]
//! ```
//!
//! A single read or a list of reads may be given. The nth call for the same
//! (source, page, tier) gets the nth read; calls past the end repeat the last.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;

use tally_recon::model::ExtractionTier;
use tally_recon::{
    ExtractedDocument, ExtractionError, ExtractionService, PageSelector, SourceDocument,
};

use crate::exit_codes::EXIT_INPUT;
use crate::CliError;

const READ_HINT: &str = "each read is an extracted document or \
    {\"error\": \"rate_limited\" | \"overloaded\" | \"failed\"}";

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FailureKind {
    RateLimited,
    Overloaded,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
struct RecordedFailure {
    error: FailureKind,
    #[serde(default)]
    retry_after_secs: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RecordedRead {
    Failure(RecordedFailure),
    Document(Box<ExtractedDocument>),
}

impl RecordedRead {
    fn to_result(&self) -> Result<ExtractedDocument, ExtractionError> {
        match self {
            Self::Document(doc) => Ok((**doc).clone()),
            Self::Failure(f) => Err(match f.error {
                FailureKind::RateLimited => ExtractionError::RateLimited {
                    retry_after_secs: f.retry_after_secs,
                },
                FailureKind::Overloaded => ExtractionError::Overloaded,
                FailureKind::Failed => ExtractionError::Failed(
                    f.message
                        .clone()
                        .unwrap_or_else(|| "recorded failure".into()),
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Reads {
    Many(Vec<RecordedRead>),
    One(RecordedRead),
}

impl Reads {
    fn nth(&self, n: usize) -> Option<&RecordedRead> {
        match self {
            Self::One(read) => Some(read),
            Self::Many(reads) => reads.get(n).or_else(|| reads.last()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TierReads {
    #[serde(default)]
    whole: Option<Reads>,
    #[serde(default)]
    first: Option<Reads>,
    #[serde(default)]
    last: Option<Reads>,
}

impl TierReads {
    fn for_page(&self, page: PageSelector) -> Option<&Reads> {
        match page {
            PageSelector::Whole => self.whole.as_ref(),
            PageSelector::First => self.first.as_ref(),
            PageSelector::Last => self.last.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RecordedSource {
    file_name: String,
    #[serde(default = "one_page")]
    page_count: usize,
    #[serde(default)]
    standard: TierReads,
    #[serde(default)]
    enhanced: TierReads,
}

fn one_page() -> usize {
    1
}

/// [`ExtractionService`] answering from a recording.
pub struct RecordedExtractor {
    sources: Vec<RecordedSource>,
    served: Mutex<HashMap<(usize, PageSelector, ExtractionTier), usize>>,
}

impl RecordedExtractor {
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        let sources: Vec<RecordedSource> = serde_json::from_str(data)?;
        Ok(Self { sources, served: Mutex::new(HashMap::new()) })
    }

    pub fn load(path: &Path) -> Result<Self, CliError> {
        let data = std::fs::read_to_string(path).map_err(|e| CliError {
            code: EXIT_INPUT,
            message: format!("cannot read {}: {e}", path.display()),
            hint: None,
        })?;
        Self::from_json(&data).map_err(|e| CliError {
            code: EXIT_INPUT,
            message: format!("{}: {e}", path.display()),
            hint: Some(READ_HINT.into()),
        })
    }

    /// Source documents in recording order. Contents are not recorded.
    pub fn sources(&self) -> Vec<SourceDocument> {
        self.sources
            .iter()
            .enumerate()
            .map(|(index, s)| SourceDocument {
                index,
                file_name: s.file_name.clone(),
                bytes: Vec::new(),
                page_count: s.page_count.max(1),
            })
            .collect()
    }

    /// Total calls served so far.
    pub fn calls(&self) -> usize {
        self.served.lock().map(|m| m.values().sum()).unwrap_or(0)
    }
}

#[async_trait]
impl ExtractionService for RecordedExtractor {
    async fn extract(
        &self,
        source: &SourceDocument,
        page: PageSelector,
        tier: ExtractionTier,
    ) -> Result<ExtractedDocument, ExtractionError> {
        let n = {
            let mut served = self
                .served
                .lock()
                .map_err(|_| ExtractionError::Failed("replay state poisoned".into()))?;
            let count = served.entry((source.index, page, tier)).or_insert(0);
            *count += 1;
            *count - 1
        };

        let recorded = self.sources.get(source.index).ok_or_else(|| {
            ExtractionError::Failed(format!("no recording for source #{}", source.index))
        })?;
        let reads = match tier {
            ExtractionTier::Standard => &recorded.standard,
            ExtractionTier::Enhanced => &recorded.enhanced,
        };
        reads
            .for_page(page)
            .and_then(|r| r.nth(n))
            .ok_or_else(|| {
                ExtractionError::Failed(format!(
                    "no recorded {tier} read of {:?} for {}",
                    page, recorded.file_name
                ))
            })?
            .to_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDING: &str = r#"[
        {
            "file_name": "a.pdf",
            "standard": {
                "whole": [
                    { "error": "rate_limited", "retry_after_secs": 3 },
                    { "document_number": "1", "tax_base": "10,00", "confidence": "high" }
                ]
            }
        },
        {
            "file_name": "b.pdf",
            "page_count": 3,
            "standard": { "first": { "document_number": "2", "confidence": "low" } },
            "enhanced": { "first": { "error": "failed", "message": "timeout" } }
        }
    ]"#;

    #[tokio::test]
    async fn nth_call_gets_nth_read_then_repeats_last() {
        let replay = RecordedExtractor::from_json(RECORDING).unwrap();
        let sources = replay.sources();
        let a = &sources[0];

        let first = replay.extract(a, PageSelector::Whole, ExtractionTier::Standard).await;
        assert!(matches!(first, Err(ExtractionError::RateLimited { retry_after_secs: Some(3) })));

        let second = replay
            .extract(a, PageSelector::Whole, ExtractionTier::Standard)
            .await
            .unwrap();
        assert_eq!(second.document_number.as_deref(), Some("1"));
        assert_eq!(second.tax_base, Some(10.0));

        let third = replay
            .extract(a, PageSelector::Whole, ExtractionTier::Standard)
            .await
            .unwrap();
        assert_eq!(third.document_number.as_deref(), Some("1"));
        assert_eq!(replay.calls(), 3);
    }

    #[tokio::test]
    async fn unrecorded_reads_fail_permanently() {
        let replay = RecordedExtractor::from_json(RECORDING).unwrap();
        let sources = replay.sources();
        assert_eq!(sources[1].page_count, 3);

        let last = replay.extract(&sources[1], PageSelector::Last, ExtractionTier::Standard).await;
        assert!(matches!(last, Err(ExtractionError::Failed(_))));

        let enhanced = replay
            .extract(&sources[1], PageSelector::First, ExtractionTier::Enhanced)
            .await;
        match enhanced {
            Err(ExtractionError::Failed(msg)) => assert_eq!(msg, "timeout"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn malformed_recording_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.json");
        std::fs::write(&path, r#"[{ "page_count": 1 }]"#).unwrap();
        let err = RecordedExtractor::load(&path).err().unwrap();
        assert_eq!(err.code, EXIT_INPUT);
        assert!(err.hint.is_some());
    }
}
