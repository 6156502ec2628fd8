//! Alert sink port.
//!
//! Alerts are fire-and-forget: `notify` never blocks the caller and never
//! reports failure. Implementations that perform I/O must hand off internally.

use crate::reconciliation::Severity;
use serde::{Deserialize, Serialize};

/// A severity-tagged operational alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Rate-limiting key (e.g. `webhook.retries_exhausted`)
    pub key: String,
    /// Severity
    pub severity: Severity,
    /// Human readable summary
    pub title: String,
    /// Structured context
    pub context: serde_json::Value,
}

impl Alert {
    /// Create an alert.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            key: key.into(),
            severity,
            title: title.into(),
            context,
        }
    }
}

/// Destination for alerts.
pub trait AlertSink: Send + Sync {
    /// Dispatch an alert without waiting for delivery.
    fn notify(&self, alert: Alert);
}
