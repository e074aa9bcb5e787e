//! Timeout + exponential backoff around a single admitted request.
//!
//! Runs as an explicit state machine so the attempt bound is visible:
//! `Attempting(n) -> BackingOff(n) -> Attempting(n + 1) -> ... -> Done`.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::{ExtractError, ExtractResult};

pub const BASE_DELAY_MS: u64 = 1_000;
pub const MAX_DELAY_MS: u64 = 16_000;
/// Upper bound of the random jitter, as a fraction of the base delay.
pub const JITTER_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl From<&SourceConfig> for RetryPolicy {
    fn from(cfg: &SourceConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries.max(1),
            timeout: cfg.timeout(),
        }
    }
}

/// `min(1000 * 2^retry, 16000)` ms, before jitter.
pub fn base_delay(retry: u32) -> Duration {
    let ms = 2u64
        .saturating_pow(retry)
        .saturating_mul(BASE_DELAY_MS)
        .min(MAX_DELAY_MS);
    Duration::from_millis(ms)
}

/// Base delay plus up to 30% random jitter.
pub fn backoff_delay(retry: u32) -> Duration {
    let base = base_delay(retry);
    let jitter = base.mul_f64(JITTER_RATIO * rand::random::<f64>());
    base + jitter
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: ExtractResult<T>,
    pub attempts: u32,
}

enum Step {
    Attempting(u32),
    BackingOff { attempt: u32, delay: Duration },
}

/// Run `op` under `policy`. Non-retriable errors end the loop at once; an
/// `InvalidResponse` is retried at most once.
pub async fn run_with_retry<T, F, Fut>(
    source: &str,
    policy: RetryPolicy,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExtractResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut invalid_seen = false;
    let mut step = Step::Attempting(1);

    loop {
        match step {
            Step::Attempting(attempt) => {
                let err = match tokio::time::timeout(policy.timeout, op()).await {
                    Ok(Ok(value)) => {
                        return RetryOutcome {
                            result: Ok(value),
                            attempts: attempt,
                        }
                    }
                    Ok(Err(e)) => e,
                    Err(_) => ExtractError::Timeout(policy.timeout),
                };

                let retry_invalid = match err {
                    ExtractError::InvalidResponse(_) => !std::mem::replace(&mut invalid_seen, true),
                    _ => true,
                };

                if !err.is_retriable() || !retry_invalid || attempt >= max_attempts {
                    if err.is_retriable() {
                        warn!(target: "limiter", source, attempt, error = %err, "retries exhausted");
                    } else {
                        debug!(target: "limiter", source, attempt, error = %err, "non-retriable failure");
                    }
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }

                let delay = backoff_delay(attempt - 1);
                debug!(
                    target: "limiter",
                    source,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                counter!("extract_source_retries_total", "source" => source.to_string())
                    .increment(1);
                step = Step::BackingOff { attempt, delay };
            }
            Step::BackingOff { attempt, delay } => {
                tokio::time::sleep(delay).await;
                step = Step::Attempting(attempt + 1);
            }
        }
    }
}
