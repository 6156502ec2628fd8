//! Component settings.
//!
//! Every struct has a `Default` matching production defaults, so tests build
//! components directly and the worker overrides fields from the environment.

use guidepay_core::commission::CommissionRate;
use guidepay_runtime::retry::{Backoff, RetryPolicy};
use std::time::Duration;

/// Booking creation settings.
#[derive(Debug, Clone)]
pub struct BookingConfig {
    /// Shortest bookable slot
    pub min_duration_minutes: u32,
    /// Longest bookable slot
    pub max_duration_minutes: u32,
    /// Slot lengths must be a multiple of this
    pub duration_step_minutes: u32,
    /// Maximum length of customer notes, in characters
    pub max_notes_chars: usize,
    /// Retry of the creation transaction on lock contention
    pub retry: RetryPolicy,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            min_duration_minutes: 30,
            max_duration_minutes: 720,
            duration_step_minutes: 15,
            max_notes_chars: 2_000,
            retry: RetryPolicy::builder()
                .max_attempts(2)
                .initial_delay(Duration::from_millis(25))
                .max_delay(Duration::from_millis(250))
                .jitter(0.5)
                .build(),
        }
    }
}

/// Payment intent settings.
#[derive(Debug, Clone)]
pub struct IntentConfig {
    /// Settlement currency sent to the provider
    pub currency: String,
    /// Bound on each provider call
    pub provider_timeout: Duration,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            currency: "usd".to_string(),
            provider_timeout: Duration::from_secs(3),
        }
    }
}

/// Webhook processing settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared signing secret
    pub signing_secret: String,
    /// Maximum age (and clock skew) of a signed timestamp
    pub signature_tolerance: Duration,
    /// Platform commission rate
    pub commission_rate: CommissionRate,
    /// Retry of the state transition on lock contention
    pub retry: RetryPolicy,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            signature_tolerance: Duration::from_secs(300),
            commission_rate: CommissionRate::default(),
            retry: RetryPolicy::builder()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(100))
                .backoff(Backoff::Linear)
                .jitter(0.0)
                .build(),
        }
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Largest tolerated difference between amounts, in minor units
    pub amount_epsilon: u64,
    /// Provider cross-checks allowed per run
    pub provider_check_limit: u32,
    /// Bound on each provider call
    pub provider_timeout: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            amount_epsilon: 1,
            provider_check_limit: 50,
            provider_timeout: Duration::from_secs(3),
        }
    }
}
