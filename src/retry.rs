//! Bounded retry with capped exponential backoff.
//!
//! Used wherever a stage talks to something that can blip: file reads and
//! URL fetches in the Loader, and every call to an embedding provider.
//! Only errors for which [`EngineError::is_retryable`] holds are retried;
//! anything else is returned on the first failure.

use std::future::Future;
use std::time::Duration;

use live_context_core::{EngineError, Result};

use crate::config::EmbeddingConfig;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `cap`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_millis(200), Duration::from_secs(5))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retries are exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retry < policy.max_retries => {
                retry += 1;
                let delay = policy.delay(retry);
                tracing::debug!(
                    op = label,
                    attempt = retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(op = label, retries = retry, error = %err, "giving up after retries");
                }
                return Err(err);
            }
        }
    }
}

/// Map an I/O error to the engine taxonomy.
pub fn io_error(context: &str, err: std::io::Error) -> EngineError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::InvalidData => EngineError::MalformedInput(format!("{}: {}", context, err)),
        _ => EngineError::TransientIo(format!("{}: {}", context, err)),
    }
}
