//! Timeout + retry wrapper around any [`Embedder`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use live_context_core::embedding::Embedder;
use live_context_core::{EngineError, Result};
use serde::Serialize;

use crate::retry::{with_retry, RetryPolicy};

/// Call counters exposed for statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedderCounters {
    /// Provider calls, including retries.
    pub attempts: u64,
    /// Calls that failed after exhausting their retries.
    pub failures: u64,
}

/// Bounds every provider call by `timeout` and retries retryable failures
/// with capped exponential backoff.
pub struct RetryingEmbedder {
    inner: Arc<dyn Embedder>,
    policy: RetryPolicy,
    timeout: Duration,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl RetryingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            timeout,
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> EmbedderCounters {
        EmbedderCounters {
            attempts: self.attempts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    async fn attempt(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let vectors = tokio::time::timeout(self.timeout, self.inner.embed(texts))
            .await
            .map_err(|_| {
                EngineError::EmbeddingUnavailable(format!(
                    "embedding call timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        let dims = self.inner.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(EngineError::MalformedInput(format!(
                "provider returned {} dimensions, expected {}",
                bad.len(),
                dims
            )));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for RetryingEmbedder {
    fn model_tag(&self) -> &str {
        self.inner.model_tag()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let result = with_retry(&self.policy, "embed", || self.attempt(texts)).await;
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}
