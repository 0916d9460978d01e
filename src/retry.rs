//! Retry with exponential backoff and jitter.
//!
//! Node updates race with the agent and with hook operators, so conflict
//! retries are the normal case, not the exception. The defaults are tuned for
//! optimistic-concurrency conflicts: short initial delay, low cap, bounded
//! attempts. Anything that survives the budget aborts the current
//! reconciliation pass and is re-derived on the next one.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Configuration for retried operations.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute `operation`, retrying while `should_retry` approves the error.
///
/// Delays grow exponentially from `initial_delay` up to `max_delay`, with
/// 0.5x–1.5x jitter to keep concurrent writers from colliding repeatedly.
/// Returns the last error once attempts are exhausted or `should_retry`
/// rejects one.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    debug!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Error is not retryable"
                    );
                    return Err(e);
                }

                if attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the nominal delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
