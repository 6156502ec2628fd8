//! Rate-limited, fire-and-forget alert dispatch.
//!
//! Alerts are capped per key within a fixed time window. The window and the
//! counter are injected: [`InMemoryWindowCounter`] suits a single instance,
//! while multi-instance deployments plug in a shared [`WindowCounter`].

use chrono::{DateTime, Utc};
use guidepay_core::alert::{Alert, AlertSink};
use guidepay_core::environment::Clock;
use guidepay_core::reconciliation::Severity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Counts events per key within fixed windows.
pub trait WindowCounter: Send + Sync {
    /// Increment the count of `key` in the window starting at `window_start`
    /// and return the new count.
    fn increment(&self, key: &str, window_start: DateTime<Utc>) -> u32;
}

/// Process-local [`WindowCounter`].
///
/// Only the current window of each key is kept, so memory is bounded by the
/// number of distinct keys.
#[derive(Debug, Default)]
pub struct InMemoryWindowCounter {
    windows: Mutex<HashMap<String, (DateTime<Utc>, u32)>>,
}

impl InMemoryWindowCounter {
    /// Create an empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WindowCounter for InMemoryWindowCounter {
    fn increment(&self, key: &str, window_start: DateTime<Utc>) -> u32 {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = windows
            .entry(key.to_string())
            .or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        entry.1 = entry.1.saturating_add(1);
        entry.1
    }
}

/// Alert rate-limit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertLimits {
    /// Fixed window length
    pub window: Duration,
    /// Alerts allowed per key per window
    pub max_per_window: u32,
}

impl Default for AlertLimits {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            max_per_window: 5,
        }
    }
}

/// [`AlertSink`] decorator that drops alerts over the per-key limit.
pub struct RateLimitedAlerter {
    inner: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    counter: Arc<dyn WindowCounter>,
    limits: AlertLimits,
}

impl RateLimitedAlerter {
    /// Wrap `inner` with rate limiting.
    #[must_use]
    pub fn new(
        inner: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        counter: Arc<dyn WindowCounter>,
        limits: AlertLimits,
    ) -> Self {
        Self {
            inner,
            clock,
            counter,
            limits,
        }
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window_secs = i64::try_from(self.limits.window.as_secs())
            .unwrap_or(i64::MAX)
            .max(1);
        let start = now.timestamp().div_euclid(window_secs) * window_secs;
        DateTime::from_timestamp(start, 0).unwrap_or(now)
    }
}

impl AlertSink for RateLimitedAlerter {
    fn notify(&self, alert: Alert) {
        let window_start = self.window_start(self.clock.now());
        let count = self.counter.increment(&alert.key, window_start);
        if count > self.limits.max_per_window {
            tracing::debug!(key = %alert.key, count, "Alert suppressed by rate limit");
            metrics::counter!("guidepay.alerts.suppressed", "key" => alert.key).increment(1);
            return;
        }
        self.inner.notify(alert);
    }
}

/// [`AlertSink`] that emits alerts as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: Alert) {
        metrics::counter!("guidepay.alerts.sent", "severity" => alert.severity.as_str())
            .increment(1);
        match alert.severity {
            Severity::Critical | Severity::High => tracing::error!(
                alert = %alert.key,
                severity = %alert.severity,
                context = %alert.context,
                "{}",
                alert.title
            ),
            Severity::Medium => tracing::warn!(
                alert = %alert.key,
                severity = %alert.severity,
                context = %alert.context,
                "{}",
                alert.title
            ),
            Severity::Low => tracing::info!(
                alert = %alert.key,
                severity = %alert.severity,
                context = %alert.context,
                "{}",
                alert.title
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Collect(Mutex<Vec<Alert>>);

    impl AlertSink for Collect {
        fn notify(&self, alert: Alert) {
            self.0.lock().unwrap().push(alert);
        }
    }

    struct MovableClock(Mutex<DateTime<Utc>>);

    impl Clock for MovableClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn alert(key: &str) -> Alert {
        Alert::new(key, Severity::High, "test", serde_json::json!({}))
    }

    #[test]
    fn caps_alerts_per_key_within_window() {
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(MovableClock(Mutex::new(start)));
        let alerter = RateLimitedAlerter::new(
            sink.clone(),
            clock.clone(),
            Arc::new(InMemoryWindowCounter::new()),
            AlertLimits {
                window: Duration::from_secs(60),
                max_per_window: 2,
            },
        );

        for _ in 0..5 {
            alerter.notify(alert("webhook.failed"));
        }
        alerter.notify(alert("reconciliation.finding"));
        assert_eq!(sink.0.lock().unwrap().len(), 3);

        *clock.0.lock().unwrap() = start + chrono::Duration::seconds(61);
        alerter.notify(alert("webhook.failed"));
        assert_eq!(sink.0.lock().unwrap().len(), 4);
    }

    #[test]
    fn counter_resets_on_new_window() {
        let counter = InMemoryWindowCounter::new();
        let w1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let w2 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap();
        assert_eq!(counter.increment("k", w1), 1);
        assert_eq!(counter.increment("k", w1), 2);
        assert_eq!(counter.increment("k", w2), 1);
        assert_eq!(counter.increment("other", w2), 1);
    }
}
