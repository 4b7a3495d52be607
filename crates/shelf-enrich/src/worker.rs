//! Per-entity enrichment: fetch, extract, retry.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::extract::FieldExtractor;
use crate::fetch::DocumentSource;
use crate::types::{EnrichmentResult, FetchError, RotationError};

/// Characters of a failing document kept for diagnostics.
const DIAGNOSTIC_EXCERPT_CHARS: usize = 2_000;

/// Bounded retry. Attempts are immediate; `max_attempts` includes the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_RETRIES)
    }
}

enum Failure {
    Fetch(String),
    Gap(String),
}

/// Composes a document source and the field extractor for one entity.
#[derive(Clone)]
pub struct EnrichmentWorker {
    source: Arc<dyn DocumentSource>,
    extractor: Arc<FieldExtractor>,
    policy: RetryPolicy,
}

impl EnrichmentWorker {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        extractor: Arc<FieldExtractor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            extractor,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Enrich one entity.
    ///
    /// Fetch errors and incomplete documents are retried; the failure kind of
    /// the last attempt decides between `FetchFailure` and `PartialFailure`.
    /// Only an identity rotation failure escapes as `Err`.
    pub async fn enrich(&self, key: &str) -> Result<EnrichmentResult, RotationError> {
        let max = self.policy.max_attempts;
        let mut last = None;

        for attempt in 1..=max {
            match self.source.fetch(key).await {
                Err(FetchError::Identity(e)) => return Err(e),
                Err(e) => {
                    debug!(key, attempt, max, "fetch failed: {e}");
                    last = Some(Failure::Fetch(e.to_string()));
                }
                Ok(doc) => match self.extractor.extract(&doc.body).complete() {
                    Ok(fields) => {
                        return Ok(EnrichmentResult::Success {
                            fields,
                            attempts: attempt,
                        })
                    }
                    Err(gap) => {
                        debug!(key, attempt, max, url = %doc.final_url, "{gap}");
                        trace!(
                            key,
                            "diagnostic document excerpt:\n{}",
                            excerpt(&doc.body, DIAGNOSTIC_EXCERPT_CHARS)
                        );
                        last = Some(Failure::Gap(format!("{gap} on {}", doc.final_url)));
                    }
                },
            }
        }

        let result = match last {
            Some(Failure::Gap(reason)) => EnrichmentResult::PartialFailure {
                reason,
                attempts: max,
            },
            Some(Failure::Fetch(reason)) => EnrichmentResult::FetchFailure {
                reason,
                attempts: max,
            },
            None => EnrichmentResult::FetchFailure {
                reason: "no attempt made".to_string(),
                attempts: 0,
            },
        };
        debug!(key, attempts = max, "giving up: {}", result.reason().unwrap_or_default());
        Ok(result)
    }
}

fn excerpt(body: &str, max_chars: usize) -> &str {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectorConfig;
    use crate::fetch::Document;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const BOOK_PAGE: &str = include_str!("../tests/fixtures/book_show.html");
    const INTERSTITIAL: &str = include_str!("../tests/fixtures/interstitial.html");

    type Script = Box<dyn Fn(u32) -> Result<Document, FetchError> + Send + Sync>;

    /// Answers attempt `n` (1-based) with `script(n)`.
    struct ScriptedSource {
        calls: AtomicU32,
        script: Script,
    }

    impl ScriptedSource {
        fn new(script: impl Fn(u32) -> Result<Document, FetchError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Box::new(script),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentSource for ScriptedSource {
        async fn fetch(&self, _key: &str) -> Result<Document, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.script)(n)
        }
    }

    fn doc(body: &str) -> Document {
        Document {
            url: "http://books.test/show/1".into(),
            final_url: "http://books.test/show/1".into(),
            status: 200,
            body: body.to_string(),
            generation: 0,
        }
    }

    fn unavailable() -> FetchError {
        FetchError::Status {
            url: "http://books.test/show/1".into(),
            status: 503,
        }
    }

    fn worker(source: Arc<ScriptedSource>, max: u32) -> EnrichmentWorker {
        let extractor = FieldExtractor::new(&SelectorConfig::default()).unwrap();
        EnrichmentWorker::new(source, Arc::new(extractor), RetryPolicy::new(max))
    }

    #[tokio::test]
    async fn test_always_failing_fetch_makes_exactly_max_attempts() {
        let source = ScriptedSource::new(|_| Err(unavailable()));
        let result = worker(source.clone(), 3).enrich("1").await.unwrap();
        assert_eq!(source.calls(), 3);
        match result {
            EnrichmentResult::FetchFailure { reason, attempts } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("503"));
            }
            other => panic!("expected FetchFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_stops_retrying() {
        let source = ScriptedSource::new(|n| if n == 1 { Err(unavailable()) } else { Ok(doc(BOOK_PAGE)) });
        let result = worker(source.clone(), 3).enrich("1").await.unwrap();
        assert_eq!(source.calls(), 2);
        match result {
            EnrichmentResult::Success { fields, attempts } => {
                assert_eq!(attempts, 2);
                assert_eq!(fields.taxonomy_column(), "Fantasy, Young Adult > Young Adult Fantasy");
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_fields_become_partial_failure() {
        let source = ScriptedSource::new(|_| Ok(doc(INTERSTITIAL)));
        let result = worker(source.clone(), 3).enrich("1").await.unwrap();
        assert_eq!(source.calls(), 3);
        assert!(matches!(
            result,
            EnrichmentResult::PartialFailure { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_last_attempt_decides_failure_kind() {
        let source = ScriptedSource::new(|n| if n < 3 { Ok(doc(INTERSTITIAL)) } else { Err(unavailable()) });
        let result = worker(source, 3).enrich("1").await.unwrap();
        assert!(matches!(result, EnrichmentResult::FetchFailure { .. }));
    }

    #[tokio::test]
    async fn test_identity_failure_escapes_immediately() {
        let source = ScriptedSource::new(|_| {
            Err(FetchError::Identity(RotationError::CircuitNotEstablished { attempts: 3 }))
        });
        let result = worker(source.clone(), 3).enrich("1").await;
        assert!(matches!(
            result,
            Err(RotationError::CircuitNotEstablished { attempts: 3 })
        ));
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_policy_floor_is_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts(), 1);
        assert_eq!(RetryPolicy::default().max_attempts(), 3);
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé");
        assert_eq!(excerpt("abc", 10), "abc");
    }
}
