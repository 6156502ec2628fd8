//! Alert sink that records what it is given.

#![allow(clippy::missing_panics_doc)]

use guidepay_core::alert::{Alert, AlertSink};
use guidepay_core::reconciliation::Severity;
use std::sync::{Mutex, PoisonError};

/// [`AlertSink`] that keeps every alert for later assertions.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Alerts received with `key`.
    #[must_use]
    pub fn with_key(&self, key: &str) -> Vec<Alert> {
        self.alerts().into_iter().filter(|a| a.key == key).collect()
    }

    /// Alerts at or above `severity`.
    #[must_use]
    pub fn at_least(&self, severity: Severity) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|a| a.severity >= severity)
            .collect()
    }
}

impl AlertSink for RecordingAlertSink {
    fn notify(&self, alert: Alert) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}
