//! Boundary to the external, rate-limited extraction service.
//!
//! The service itself (OCR, text mining, model calls) lives outside this
//! crate. Here we only define its contract and the single-worker [`Pacer`]
//! that keeps one call in flight, spaces calls out, and retries transient
//! failures with exponential backoff.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PacingConfig;
use crate::model::{ExtractedDocument, ExtractionStats, ExtractionTier};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction service rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("extraction service overloaded")]
    Overloaded,

    #[error("extraction failed: {0}")]
    Failed(String),
}

impl ExtractionError {
    /// Worth retrying the same request after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Overloaded)
    }
}

/// Raw source file handed to the extraction service.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub index: usize,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub page_count: usize,
}

impl SourceDocument {
    pub fn is_multi_page(&self) -> bool {
        self.page_count > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageSelector {
    Whole,
    First,
    Last,
}

#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Read one page selection of `source` with the given tier.
    async fn extract(
        &self,
        source: &SourceDocument,
        page: PageSelector,
        tier: ExtractionTier,
    ) -> Result<ExtractedDocument, ExtractionError>;
}

/// `base * 2^attempt`, capped at `max_ms`.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Single worker in front of the extraction service. Taking `&mut self`
/// for every call means at most one request is ever in flight.
pub struct Pacer<'a> {
    service: &'a dyn ExtractionService,
    pacing: PacingConfig,
    /// When the previous response arrived.
    last_call: Option<Instant>,
    exhausted_sources: HashSet<usize>,
    stats: ExtractionStats,
}

impl<'a> Pacer<'a> {
    pub fn new(service: &'a dyn ExtractionService, pacing: PacingConfig) -> Self {
        Self {
            service,
            pacing,
            last_call: None,
            exhausted_sources: HashSet::new(),
            stats: ExtractionStats::default(),
        }
    }

    pub fn stats(&self) -> &ExtractionStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ExtractionStats {
        &mut self.stats
    }

    pub fn into_stats(self) -> ExtractionStats {
        self.stats
    }

    /// Extract with pacing and retries. Never fails: a document whose
    /// retries run out, or whose extraction fails outright, comes back as
    /// an unreadable placeholder.
    pub async fn extract(
        &mut self,
        source: &SourceDocument,
        page: PageSelector,
        tier: ExtractionTier,
    ) -> ExtractedDocument {
        let mut attempt = 0;
        loop {
            self.wait_turn(tier).await;
            self.stats.calls += 1;

            let reply = self.service.extract(source, page, tier).await;
            self.last_call = Some(Instant::now());

            match reply {
                Ok(mut doc) => {
                    doc.source_index = source.index;
                    doc.file_name = source.file_name.clone();
                    debug!(
                        file = %source.file_name,
                        ?page,
                        %tier,
                        confidence = %doc.confidence,
                        "extracted"
                    );
                    return doc;
                }
                Err(err) if err.is_transient() => {
                    if attempt >= self.pacing.max_retries {
                        // counted once per source, however many pages ran out
                        if self.exhausted_sources.insert(source.index) {
                            self.stats.exhausted += 1;
                        }
                        warn!(
                            file = %source.file_name,
                            attempts = attempt + 1,
                            "retries exhausted, marking unreadable: {err}"
                        );
                        return ExtractedDocument::unreadable(source.index, &source.file_name);
                    }
                    let wait = self.retry_wait(&err, attempt);
                    warn!(
                        file = %source.file_name,
                        attempt = attempt + 1,
                        "{err}, waiting {wait:?}"
                    );
                    self.stats.transient_retries += 1;
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.stats.failed += 1;
                    warn!(file = %source.file_name, "{err}");
                    return ExtractedDocument::unreadable(source.index, &source.file_name);
                }
            }
        }
    }

    fn retry_wait(&self, err: &ExtractionError, attempt: u32) -> Duration {
        let backoff =
            backoff_delay(attempt, self.pacing.backoff_base_ms, self.pacing.backoff_max_ms);
        match err {
            ExtractionError::RateLimited {
                retry_after_secs: Some(secs),
            } => Duration::from_secs(*secs).min(Duration::from_millis(self.pacing.backoff_max_ms)),
            _ => backoff,
        }
    }

    /// Fixed gap since the previous response, plus the escalation delay
    /// before any enhanced-tier call.
    async fn wait_turn(&self, tier: ExtractionTier) {
        if let Some(last) = self.last_call {
            tokio::time::sleep_until(last + self.pacing.request_delay()).await;
        }
        if tier == ExtractionTier::Enhanced {
            let delay = self.pacing.escalation_delay();
            if delay > Duration::ZERO {
                debug!("waiting {delay:?} before enhanced extraction");
                tokio::time::sleep(delay).await;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::testing::*;
    use super::*;
    use crate::config::PageConfig;
    use crate::model::Confidence;

    fn readable(number: &str) -> ExtractedDocument {
        let mut d = ExtractedDocument::unreadable(0, "");
        d.document_number = Some(number.into());
        d.confidence = Confidence::High;
        d
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0, 2000, 60_000), Duration::from_millis(2000));
        assert_eq!(backoff_delay(1, 2000, 60_000), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3, 2000, 60_000), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(10, 2000, 60_000), Duration::from_millis(60_000));
        assert_eq!(backoff_delay(70, 2000, 60_000), Duration::from_millis(60_000));
    }

    #[test]
    fn transient_classification() {
        assert!(ExtractionError::RateLimited { retry_after_secs: None }.is_transient());
        assert!(ExtractionError::Overloaded.is_transient());
        assert!(!ExtractionError::Failed("bad pdf".into()).is_transient());
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let service = ScriptedService::default();
        let tier = ExtractionTier::Standard;
        let limited = ExtractionError::RateLimited { retry_after_secs: Some(1) };
        service.reply(3, PageSelector::Whole, tier, Err(limited));
        service.reply(3, PageSelector::Whole, tier, Err(ExtractionError::Overloaded));
        service.reply(3, PageSelector::Whole, tier, Ok(readable("7")));

        let mut pacer = Pacer::new(&service, fast_pacing());
        let doc = pacer.extract(&source(3, 1), PageSelector::Whole, tier).await;
        assert_eq!(doc.document_number.as_deref(), Some("7"));
        assert_eq!(doc.source_index, 3);
        assert_eq!(doc.file_name, "doc3.pdf");
        assert_eq!(pacer.stats().calls, 3);
        assert_eq!(pacer.stats().transient_retries, 2);
        assert_eq!(pacer.stats().exhausted, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_become_unreadable() {
        let service = ScriptedService::default();
        let tier = ExtractionTier::Standard;
        for _ in 0..10 {
            service.reply(0, PageSelector::Whole, tier, Err(ExtractionError::Overloaded));
        }
        let mut pacing = fast_pacing();
        pacing.max_retries = 2;
        let mut pacer = Pacer::new(&service, pacing);
        let doc = pacer.extract(&source(0, 1), PageSelector::Whole, tier).await;
        assert_eq!(doc.confidence, Confidence::Unreadable);
        assert_eq!(service.call_count(), 3);
        assert_eq!(pacer.stats().exhausted, 1);
    }

    #[tokio::test]
    async fn exhausted_pages_count_once_per_document() {
        let service = ScriptedService::default();
        let tier = ExtractionTier::Standard;
        for page in [PageSelector::First, PageSelector::Last] {
            for _ in 0..3 {
                service.reply(5, page, tier, Err(ExtractionError::Overloaded));
            }
        }
        let mut pacing = fast_pacing();
        pacing.max_retries = 2;
        let mut pacer = Pacer::new(&service, pacing);
        let pages = PageConfig::default();
        let doc = crate::pages::read_source(&mut pacer, &source(5, 4), tier, &pages).await;
        assert_eq!(doc.confidence, Confidence::Unreadable);
        assert_eq!(service.call_count(), 6);
        assert_eq!(pacer.stats().exhausted, 1);
    }

    /// Answers after a fixed processing time, recording when each call began.
    struct SlowService {
        busy: Duration,
        started: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl ExtractionService for SlowService {
        async fn extract(
            &self,
            _source: &SourceDocument,
            _page: PageSelector,
            _tier: ExtractionTier,
        ) -> Result<ExtractedDocument, ExtractionError> {
            self.started.lock().unwrap().push(Instant::now());
            tokio::time::sleep(self.busy).await;
            Ok(readable("1"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_gap_runs_from_previous_response() {
        let service = SlowService {
            busy: Duration::from_millis(800),
            started: Mutex::new(Vec::new()),
        };
        let mut pacing = fast_pacing();
        pacing.request_delay_ms = 1000;
        let mut pacer = Pacer::new(&service, pacing);

        pacer.extract(&source(0, 1), PageSelector::Whole, ExtractionTier::Standard).await;
        pacer.extract(&source(1, 1), PageSelector::Whole, ExtractionTier::Standard).await;

        let started = service.started.lock().unwrap();
        assert_eq!(started.len(), 2);
        assert!(started[1] - started[0] >= Duration::from_millis(1800));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let service = ScriptedService::default();
        let mut pacer = Pacer::new(&service, fast_pacing());
        let doc = pacer
            .extract(&source(1, 1), PageSelector::Whole, ExtractionTier::Enhanced)
            .await;
        assert_eq!(doc.confidence, Confidence::Unreadable);
        assert_eq!(doc.file_name, "doc1.pdf");
        assert_eq!(service.call_count(), 1);
        assert_eq!(pacer.into_stats().failed, 1);
    }
}
