//! Bounded retry combinator for transactional units.
//!
//! Each attempt re-runs the whole unit (open transaction, work, commit), so the
//! operation closure must be safe to run again after a rolled-back attempt.
//!
//! # Example
//!
//! ```rust
//! use guidepay_runtime::retry::{Backoff, RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .initial_delay(Duration::from_millis(50))
//!     .backoff(Backoff::Linear)
//!     .build();
//!
//! let value = retry_with_predicate(
//!     &policy,
//!     "example",
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("deadlock"),
//! )
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Growth of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `initial_delay × retry`
    Linear,
    /// `initial_delay × multiplier^(retry − 1)`
    Exponential {
        /// Growth factor
        multiplier: f64,
    },
}

/// Retry policy.
///
/// # Default Values
///
/// - `max_attempts`: 3 (first try included)
/// - `initial_delay`: 50ms
/// - `max_delay`: 2 seconds
/// - `backoff`: exponential ×2
/// - `jitter`: 0.2 (±20% of the computed delay)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Delay growth
    pub backoff: Backoff,
    /// Random spread applied to each delay, as a fraction in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff: Backoff::Exponential { multiplier: 2.0 },
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.initial_delay.saturating_mul(retry),
            Backoff::Exponential { multiplier } => {
                #[allow(clippy::cast_possible_wrap)] // Attempt counts are single digits
                let factor = multiplier.powi((retry - 1) as i32);
                self.initial_delay.mul_f64(factor.max(0.0).min(1e6))
            }
        };
        delay.min(self.max_delay)
    }

    /// Delay before retry number `retry` with jitter applied.
    #[must_use]
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.delay_for_retry(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(1.0 + spread)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set total attempts (at least 1).
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set the cap on any single delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the delay growth.
    #[must_use]
    pub const fn backoff(mut self, backoff: Backoff) -> Self {
        self.policy.backoff = backoff;
        self
    }

    /// Set the jitter fraction.
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or `policy.max_attempts` is spent.
///
/// The last error is returned unchanged, so callers can tell exhaustion
/// (a retryable error came back) from a fatal failure.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &'static str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    metrics::counter!("guidepay.retry.exhausted", "operation" => operation_name)
                        .increment(1);
                    return Err(err);
                }

                let delay = policy.jittered_delay(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                metrics::counter!("guidepay.retry.attempts", "operation" => operation_name)
                    .increment(1);

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
