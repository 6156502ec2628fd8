//! Reconciliation findings, audit rows and run checkpoints.

use crate::booking::{Booking, BookingPaymentStatus, BookingStatus};
use crate::payment::Payment;
use crate::types::{BookingId, Money, PaymentId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

text_enum! {
    /// Severity of a finding or alert.
    pub enum Severity {
        /// Informational
        Low => "low",
        /// Worth a look
        Medium => "medium",
        /// Needs attention today
        High => "high",
        /// Needs attention now
        Critical => "critical",
    }
}

text_enum! {
    /// Kind of drift detected.
    pub enum AnomalyType {
        /// Payment whose booking does not exist
        OrphanPayment => "orphan_payment",
        /// Booking references an intent with no payment row
        MissingPaymentRecord => "missing_payment_record",
        /// Payment amount differs from booking total
        AmountMismatch => "amount_mismatch",
        /// Payment and booking statuses disagree
        StatusMismatch => "status_mismatch",
        /// Booking marked paid without any succeeded payment
        PaidWithoutSuccess => "paid_without_success",
        /// Provider reports a different status than the payment row
        ProviderStatusMismatch => "provider_status_mismatch",
        /// Provider reports a different amount than the payment row
        ProviderAmountMismatch => "provider_amount_mismatch",
        /// Several payment rows share one provider intent id
        DuplicateIntent => "duplicate_intent",
    }
}

impl AnomalyType {
    /// Fixed severity assigned to each anomaly.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::AmountMismatch | Self::ProviderAmountMismatch | Self::DuplicateIntent => {
                Severity::Critical
            }
            Self::OrphanPayment
            | Self::StatusMismatch
            | Self::ProviderStatusMismatch
            | Self::PaidWithoutSuccess => Severity::High,
            Self::MissingPaymentRecord => Severity::Low,
        }
    }
}

/// Persisted record of one detected drift.
///
/// `(run_id, anomaly, entity_key)` is the upsert key, so re-running a batch
/// within the same run never duplicates findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationFinding {
    /// Run that produced the finding
    pub run_id: RunId,
    /// Booking involved, if known
    pub booking_id: Option<BookingId>,
    /// Payment involved, if known
    pub payment_id: Option<PaymentId>,
    /// What was detected
    pub anomaly: AnomalyType,
    /// Severity derived from the anomaly
    pub severity: Severity,
    /// Stable key of the offending entity
    pub entity_key: String,
    /// Structured evidence
    pub details: serde_json::Value,
    /// Detection time
    pub detected_at: DateTime<Utc>,
}

impl ReconciliationFinding {
    /// Start a finding for `entity_key`; severity follows the anomaly.
    #[must_use]
    pub fn new(
        run_id: RunId,
        anomaly: AnomalyType,
        entity_key: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            booking_id: None,
            payment_id: None,
            anomaly,
            severity: anomaly.severity(),
            entity_key: entity_key.into(),
            details: serde_json::Value::Null,
            detected_at,
        }
    }

    /// Attach the booking.
    #[must_use]
    pub const fn with_booking(mut self, booking_id: BookingId) -> Self {
        self.booking_id = Some(booking_id);
        self
    }

    /// Attach the payment.
    #[must_use]
    pub const fn with_payment(mut self, payment_id: PaymentId) -> Self {
        self.payment_id = Some(payment_id);
        self
    }

    /// Attach structured evidence.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Booking columns the audit needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingAuditView {
    /// Row id
    pub id: BookingId,
    /// Lifecycle status
    pub status: BookingStatus,
    /// Payment progress
    pub payment_status: BookingPaymentStatus,
    /// Booking total
    pub total: Money,
    /// Stored intent reference
    pub payment_intent_id: Option<String>,
}

impl From<&Booking> for BookingAuditView {
    fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id,
            status: booking.status,
            payment_status: booking.payment_status,
            total: booking.total(),
            payment_intent_id: booking.payment_intent_id.clone(),
        }
    }
}

/// A payment row joined to its booking (`None` when the booking is missing).
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentAuditRow {
    /// The payment
    pub payment: Payment,
    /// Joined booking
    pub booking: Option<BookingAuditView>,
}

/// A booking row with the payment facts the audit needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingAuditRow {
    /// The booking
    pub booking: BookingAuditView,
    /// A payment row exists for the stored intent reference
    pub has_payment_for_intent: bool,
    /// Any payment row for this booking has succeeded
    pub has_succeeded_payment: bool,
}

/// Provider intent id shared by more than one payment row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateIntent {
    /// The shared intent id
    pub intent_id: String,
    /// Payment rows carrying it, ascending
    pub payment_ids: Vec<PaymentId>,
}

text_enum! {
    /// Stage a reconciliation run has reached.
    pub enum ReconciliationPhase {
        /// Paging through payments joined to bookings
        Payments => "payments",
        /// Paging through bookings with intent references
        Bookings => "bookings",
        /// Grouped duplicate-intent query
        Duplicates => "duplicates",
        /// Run finished
        Completed => "completed",
    }
}

/// Resumable progress of a run, saved between batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// Run id
    pub run_id: RunId,
    /// Current phase
    pub phase: ReconciliationPhase,
    /// Last row id processed in the current phase
    pub cursor: Option<i64>,
    /// Lower bound of the lookback window, fixed at run start
    pub since: DateTime<Utc>,
    /// Rows examined so far
    pub scanned: u64,
    /// Findings recorded so far
    pub findings: u64,
    /// Provider cross-checks spent so far
    pub provider_checks: u32,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Last checkpoint write
    pub updated_at: DateTime<Utc>,
}

impl RunCheckpoint {
    /// Fresh checkpoint for a new run.
    #[must_use]
    pub const fn start(run_id: RunId, since: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            phase: ReconciliationPhase::Payments,
            cursor: None,
            since,
            scanned: 0,
            findings: 0,
            provider_checks: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to the next phase and reset the cursor.
    pub const fn advance(&mut self, phase: ReconciliationPhase) {
        self.phase = phase;
        self.cursor = None;
    }

    /// Whether the run has finished.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.phase, ReconciliationPhase::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_follow_policy() {
        assert_eq!(AnomalyType::AmountMismatch.severity(), Severity::Critical);
        assert_eq!(AnomalyType::DuplicateIntent.severity(), Severity::Critical);
        assert_eq!(AnomalyType::OrphanPayment.severity(), Severity::High);
        assert_eq!(AnomalyType::StatusMismatch.severity(), Severity::High);
        assert_eq!(AnomalyType::PaidWithoutSuccess.severity(), Severity::High);
        assert_eq!(AnomalyType::MissingPaymentRecord.severity(), Severity::Low);
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn anomaly_text_roundtrip() {
        for anomaly in AnomalyType::ALL {
            assert_eq!(AnomalyType::parse(anomaly.as_str()).ok(), Some(*anomaly));
        }
    }
}
