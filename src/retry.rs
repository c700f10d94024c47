//! Backoff helpers for transient failures.
//!
//! Two flavours live here:
//! - [`retry_with_backoff`] retries a single async call in place (repository
//!   server requests), giving up early on errors the caller marks permanent.
//! - [`requeue_delay`] turns how long an ApplicationSet has been failing
//!   into the delay before the next pass.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for in-place retries of a single call
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Stops after `max_attempts` or as soon as `retryable` returns false for an
/// error, returning that error.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered = jitter(delay);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "operation failed, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Delay before the next pass of a set that has been failing for `failing_for`.
///
/// Waiting as long as the failure has already lasted doubles the total on
/// every pass, so this is exponential without a stored attempt counter.
/// Clamped to `base..=max`.
pub fn requeue_delay(failing_for: Duration, base: Duration, max: Duration) -> Duration {
    failing_for.clamp(base, max.max(base))
}

/// 0.5x to 1.5x of the delay
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
