//! # Guidepay Runtime
//!
//! Infrastructure shared by the engine and the worker:
//!
//! - [`retry`]: bounded retry combinator with jittered backoff and a retryable predicate
//! - [`alerting`]: rate-limited alert dispatch with an injected clock and window counter
//! - [`cache`]: process-local TTL cache for advisory snapshots
//! - [`metrics`]: metric names, recorders and the Prometheus exporter

pub mod alerting;
pub mod cache;
pub mod metrics;
pub mod retry;

pub use alerting::{AlertLimits, InMemoryWindowCounter, RateLimitedAlerter, TracingAlertSink, WindowCounter};
pub use cache::TtlCache;
pub use retry::{Backoff, RetryPolicy, retry_with_predicate};
