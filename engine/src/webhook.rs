//! Webhook processing state machine.
//!
//! Drives payments through
//!
//! ```text
//! initiated ──► processing ──► succeeded ──► (booking confirmed + commission)
//!     │              │
//!     └──────────────┴──────► failed / cancelled
//! ```
//!
//! from signed provider callbacks. Every callback is verified before anything is
//! read from the store. The success transition is one transaction (payment,
//! booking, commission, guide counters) retried on lock contention; the provider
//! gets a server error only once retries are exhausted, so it redelivers instead
//! of us acknowledging a lost confirmation.
//!
//! Redelivery and out-of-order delivery are absorbed by row locks plus state
//! checks under those locks: a second success event finds the payment succeeded
//! (or the booking confirmed) and exits as a no-op.

use crate::config::WebhookConfig;
use crate::side_effects;
use crate::signature::{self, SignatureError};
use chrono::{DateTime, Utc};
use guidepay_core::alert::{Alert, AlertSink};
use guidepay_core::booking::{BookingPaymentStatus, BookingStatus};
use guidepay_core::commission::{CommissionSplit, CommissionStatus, CommissionUpsert};
use guidepay_core::environment::Clock;
use guidepay_core::error::{ErrorKind, StoreError};
use guidepay_core::payment::{Payment, PaymentStatus, ProviderPayload, WebhookSnapshot};
use guidepay_core::queue::JobQueue;
use guidepay_core::reconciliation::Severity;
use guidepay_core::store::{LedgerStore, LedgerTx};
use guidepay_core::types::{BookingId, GuideId, Money, PaymentId};
use guidepay_runtime::metrics::WebhookMetrics;
use guidepay_runtime::retry::retry_with_predicate;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// Provider event envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookEvent {
    /// Provider event id
    pub id: String,
    /// Event type, e.g. `payment_intent.succeeded`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data
    pub data: WebhookEventData,
}

/// Data section of an event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookEventData {
    /// The object the event is about (a payment intent)
    pub object: serde_json::Value,
}

impl WebhookEvent {
    /// Provider intent id carried by the event.
    #[must_use]
    pub fn intent_id(&self) -> Option<&str> {
        self.data.object.get("id").and_then(serde_json::Value::as_str)
    }
}

/// Event types acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventKind {
    /// `payment_intent.succeeded`
    Succeeded,
    /// `payment_intent.payment_failed`
    PaymentFailed,
    /// `payment_intent.processing`
    Processing,
    /// `payment_intent.canceled`
    Canceled,
}

impl WebhookEventKind {
    /// Map a provider event type; `None` for types we ignore.
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "payment_intent.succeeded" => Some(Self::Succeeded),
            "payment_intent.payment_failed" => Some(Self::PaymentFailed),
            "payment_intent.processing" => Some(Self::Processing),
            "payment_intent.canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    const fn target_status(self) -> PaymentStatus {
        match self {
            Self::Succeeded => PaymentStatus::Succeeded,
            Self::PaymentFailed => PaymentStatus::Failed,
            Self::Processing => PaymentStatus::Processing,
            Self::Canceled => PaymentStatus::Cancelled,
        }
    }
}

/// Why an event was acknowledged without changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// No payment row carries the intent id
    UnknownPayment,
    /// Payment row points at a booking that no longer exists
    MissingBooking,
    /// Booking is already confirmed and paid
    BookingAlreadyConfirmed,
    /// Payment already succeeded; later failure events are stale
    AlreadySucceeded,
    /// Event would move the payment backwards
    StalePaymentState,
}

impl NoOpReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownPayment => "unknown_payment",
            Self::MissingBooking => "missing_booking",
            Self::BookingAlreadyConfirmed => "booking_already_confirmed",
            Self::AlreadySucceeded => "already_succeeded",
            Self::StalePaymentState => "stale_payment_state",
        }
    }
}

/// Result of handling one callback. Every variant is acknowledged (2xx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// State changed and committed
    Processed,
    /// Payment was already in the event's target state
    AlreadyProcessed,
    /// Nothing to do
    NoOp(NoOpReason),
    /// Event type not handled
    Ignored,
}

impl WebhookOutcome {
    const fn metric_label(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::AlreadyProcessed => "already_processed",
            Self::NoOp(_) => "noop",
            Self::Ignored => "ignored",
        }
    }
}

/// Webhook failures. Each maps to a non-2xx response.
#[derive(Error, Debug)]
pub enum WebhookError {
    /// Signature header missing, stale or wrong; nothing was read or written
    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    /// Body is not a recognisable event
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    /// Transaction kept failing on contention; the provider must redeliver
    #[error("Webhook processing retries exhausted: {0}")]
    RetriesExhausted(StoreError),

    /// Non-retryable store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WebhookError {
    /// Classification for propagation.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSignature(_) | Self::InvalidPayload(_) => ErrorKind::Validation,
            Self::RetriesExhausted(_) => ErrorKind::Internal,
            Self::Store(err) => err.kind(),
        }
    }

    /// HTTP status returned to the provider.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    fn is_retryable_store_error(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}

fn snapshot(event: &WebhookEvent, received_at: DateTime<Utc>) -> ProviderPayload {
    ProviderPayload::Webhook(WebhookSnapshot {
        event_id: event.id.clone(),
        event_type: event.event_type.clone(),
        received_at,
        object: event.data.object.clone(),
    })
}

/// What the success transaction did.
enum SuccessApplied {
    Confirmed {
        booking_id: BookingId,
        payment_id: PaymentId,
        guide_id: GuideId,
        split: CommissionSplit,
    },
    /// Payment captured for a booking that can no longer be confirmed
    PaidButClosed {
        booking_id: BookingId,
        payment_id: PaymentId,
        status: BookingStatus,
        amount: Money,
    },
    Unchanged(WebhookOutcome),
}

/// What a non-success transaction did.
enum TransitionApplied {
    Changed(Payment),
    Unchanged(WebhookOutcome),
}

/// Verifies and applies provider callbacks.
pub struct WebhookProcessor<S: LedgerStore> {
    store: S,
    queue: Arc<dyn JobQueue>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: WebhookConfig,
}

impl<S: LedgerStore> WebhookProcessor<S> {
    /// Create a webhook processor.
    #[must_use]
    pub fn new(
        store: S,
        queue: Arc<dyn JobQueue>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            store,
            queue,
            alerts,
            clock,
            config,
        }
    }

    /// Verify and apply one callback.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::InvalidSignature`] / [`WebhookError::InvalidPayload`]
    ///   before any store access
    /// - [`WebhookError::RetriesExhausted`] if the transaction kept failing on
    ///   contention (a critical alert is raised)
    /// - [`WebhookError::Store`] on other store failures
    pub async fn handle(
        &self,
        body: &[u8],
        signature_header: &str,
    ) -> Result<WebhookOutcome, WebhookError> {
        if let Err(error) = signature::verify(
            body,
            signature_header,
            &self.config.signing_secret,
            self.config.signature_tolerance,
            self.clock.now(),
        ) {
            WebhookMetrics::record_rejected("signature");
            tracing::warn!(error = %error, "Rejected webhook with invalid signature");
            return Err(error.into());
        }

        let event: WebhookEvent = serde_json::from_slice(body).map_err(|e| {
            WebhookMetrics::record_rejected("payload");
            WebhookError::InvalidPayload(e.to_string())
        })?;

        let Some(kind) = WebhookEventKind::from_event_type(&event.event_type) else {
            tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Ignoring webhook event");
            WebhookMetrics::record_processed(WebhookOutcome::Ignored.metric_label());
            return Ok(WebhookOutcome::Ignored);
        };

        let Some(intent_id) = event.intent_id().map(str::to_owned) else {
            WebhookMetrics::record_rejected("payload");
            return Err(WebhookError::InvalidPayload(
                "data.object.id is missing".to_string(),
            ));
        };

        let result = match kind {
            WebhookEventKind::Succeeded => self.handle_succeeded(&event, &intent_id).await,
            other => self.handle_transition(&event, &intent_id, other).await,
        };

        match &result {
            Ok(outcome) => {
                WebhookMetrics::record_processed(outcome.metric_label());
                if let WebhookOutcome::NoOp(reason) = outcome {
                    tracing::info!(
                        event_id = %event.id,
                        intent_id = %intent_id,
                        reason = reason.as_str(),
                        "Webhook acknowledged without changes"
                    );
                }
            }
            Err(_) => WebhookMetrics::record_processed("error"),
        }
        result
    }

    async fn handle_succeeded(
        &self,
        event: &WebhookEvent,
        intent_id: &str,
    ) -> Result<WebhookOutcome, WebhookError> {
        // Unlocked fast path; redeliveries of an applied success stop here.
        match self.store.find_payment_by_intent(intent_id).await {
            Ok(Some(payment)) if payment.status == PaymentStatus::Succeeded => {
                tracing::debug!(intent_id = %intent_id, "Payment already succeeded");
                return Ok(WebhookOutcome::AlreadyProcessed);
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(intent_id = %intent_id, error = %error, "Fast-path lookup failed, continuing");
            }
        }

        let applied = retry_with_predicate(
            &self.config.retry,
            "webhook.payment_succeeded",
            || self.apply_success(event, intent_id),
            WebhookError::is_retryable_store_error,
        )
        .await
        .map_err(|error| self.escalate(error, event, intent_id))?;

        match applied {
            SuccessApplied::Confirmed {
                booking_id,
                payment_id,
                guide_id,
                split,
            } => {
                tracing::info!(
                    event_id = %event.id,
                    booking_id = %booking_id,
                    payment_id = %payment_id,
                    gross = %split.gross,
                    platform_amount = %split.platform_amount,
                    "Payment succeeded, booking confirmed"
                );
                side_effects::dispatch(
                    &self.queue,
                    side_effects::payment_succeeded_jobs(booking_id, payment_id, guide_id, split.gross),
                );
                Ok(WebhookOutcome::Processed)
            }
            SuccessApplied::PaidButClosed {
                booking_id,
                payment_id,
                status,
                amount,
            } => {
                tracing::error!(
                    booking_id = %booking_id,
                    payment_id = %payment_id,
                    status = %status,
                    "Payment captured for a booking that cannot be confirmed"
                );
                self.alerts.notify(Alert::new(
                    "webhook.paid_closed_booking",
                    Severity::Critical,
                    "Payment captured for a closed booking; refund needed",
                    json!({
                        "booking_id": booking_id,
                        "payment_id": payment_id,
                        "booking_status": status,
                        "amount": amount,
                    }),
                ));
                Ok(WebhookOutcome::Processed)
            }
            SuccessApplied::Unchanged(outcome) => Ok(outcome),
        }
    }

    async fn apply_success(
        &self,
        event: &WebhookEvent,
        intent_id: &str,
    ) -> Result<SuccessApplied, WebhookError> {
        let now = self.clock.now();
        // Locks follow the intent manager's order (booking, then payment); a
        // payment's booking never changes, so an unlocked read finds it.
        let Some(known) = self.store.find_payment_by_intent(intent_id).await? else {
            return Ok(SuccessApplied::Unchanged(WebhookOutcome::NoOp(
                NoOpReason::UnknownPayment,
            )));
        };
        let mut tx = self.store.begin().await?;

        let booking = tx.lock_booking(known.booking_id).await?;
        let Some(mut payment) = tx.lock_payment_by_intent(intent_id).await? else {
            tx.rollback().await?;
            return Ok(SuccessApplied::Unchanged(WebhookOutcome::NoOp(
                NoOpReason::UnknownPayment,
            )));
        };
        if payment.status == PaymentStatus::Succeeded {
            tx.rollback().await?;
            return Ok(SuccessApplied::Unchanged(WebhookOutcome::AlreadyProcessed));
        }

        let Some(mut booking) = booking else {
            tx.rollback().await?;
            return Ok(SuccessApplied::Unchanged(WebhookOutcome::NoOp(
                NoOpReason::MissingBooking,
            )));
        };
        if booking.status == BookingStatus::Confirmed
            || booking.payment_status == BookingPaymentStatus::Paid
        {
            tx.rollback().await?;
            return Ok(SuccessApplied::Unchanged(WebhookOutcome::NoOp(
                NoOpReason::BookingAlreadyConfirmed,
            )));
        }

        payment.status = PaymentStatus::Succeeded;
        payment.provider_payload = Some(snapshot(event, now));
        payment.updated_at = now;
        tx.update_payment(&payment).await?;

        if let Err(invalid) = booking.confirm_paid(now) {
            tx.commit().await?;
            return Ok(SuccessApplied::PaidButClosed {
                booking_id: booking.id,
                payment_id: payment.id,
                status: invalid.from,
                amount: payment.amount,
            });
        }
        booking.payment_intent_id = Some(payment.intent_id.clone());
        tx.update_booking(&booking).await?;

        let split = CommissionSplit::compute(payment.amount, self.config.commission_rate);
        if let Some(existing) = tx.lock_commission(booking.id).await? {
            tracing::debug!(booking_id = %booking.id, commission_id = existing.id, "Overwriting existing commission");
        }
        tx.upsert_commission(CommissionUpsert {
            booking_id: booking.id,
            split,
            status: CommissionStatus::Settled,
            at: now,
        })
        .await?;

        if !tx
            .record_guide_earnings(booking.guide_id, booking.id, split.guide_amount)
            .await?
        {
            tracing::warn!(guide_id = %booking.guide_id, "Guide counters unavailable, skipped");
        }

        tx.commit().await?;
        Ok(SuccessApplied::Confirmed {
            booking_id: booking.id,
            payment_id: payment.id,
            guide_id: booking.guide_id,
            split,
        })
    }

    async fn handle_transition(
        &self,
        event: &WebhookEvent,
        intent_id: &str,
        kind: WebhookEventKind,
    ) -> Result<WebhookOutcome, WebhookError> {
        let applied = retry_with_predicate(
            &self.config.retry,
            "webhook.payment_transition",
            || self.apply_transition(event, intent_id, kind.target_status()),
            WebhookError::is_retryable_store_error,
        )
        .await
        .map_err(|error| self.escalate(error, event, intent_id))?;

        let payment = match applied {
            TransitionApplied::Changed(payment) => payment,
            TransitionApplied::Unchanged(outcome) => return Ok(outcome),
        };

        tracing::info!(
            event_id = %event.id,
            payment_id = %payment.id,
            booking_id = %payment.booking_id,
            status = %payment.status,
            "Payment status updated"
        );

        if kind == WebhookEventKind::PaymentFailed {
            side_effects::dispatch(
                &self.queue,
                side_effects::payment_failed_jobs(payment.booking_id, payment.id),
            );
            self.alerts.notify(Alert::new(
                "webhook.payment_failed",
                Severity::Medium,
                "Payment failed",
                json!({
                    "booking_id": payment.booking_id,
                    "payment_id": payment.id,
                    "intent_id": payment.intent_id,
                    "failure": event.data.object.get("last_payment_error").cloned(),
                }),
            ));
        }
        Ok(WebhookOutcome::Processed)
    }

    async fn apply_transition(
        &self,
        event: &WebhookEvent,
        intent_id: &str,
        target: PaymentStatus,
    ) -> Result<TransitionApplied, WebhookError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let Some(mut payment) = tx.lock_payment_by_intent(intent_id).await? else {
            tx.rollback().await?;
            return Ok(TransitionApplied::Unchanged(WebhookOutcome::NoOp(
                NoOpReason::UnknownPayment,
            )));
        };

        let unchanged = if payment.status == target {
            Some(WebhookOutcome::AlreadyProcessed)
        } else if payment.status == PaymentStatus::Succeeded {
            Some(WebhookOutcome::NoOp(NoOpReason::AlreadySucceeded))
        } else if target == PaymentStatus::Processing && payment.status != PaymentStatus::Initiated {
            Some(WebhookOutcome::NoOp(NoOpReason::StalePaymentState))
        } else {
            None
        };
        if let Some(outcome) = unchanged {
            tx.rollback().await?;
            return Ok(TransitionApplied::Unchanged(outcome));
        }

        payment.status = target;
        payment.provider_payload = Some(snapshot(event, now));
        payment.updated_at = now;
        tx.update_payment(&payment).await?;
        tx.commit().await?;
        Ok(TransitionApplied::Changed(payment))
    }

    fn escalate(&self, error: WebhookError, event: &WebhookEvent, intent_id: &str) -> WebhookError {
        match error {
            WebhookError::Store(err) if err.is_retryable() => {
                tracing::error!(
                    event_id = %event.id,
                    intent_id = %intent_id,
                    error = %err,
                    "Webhook transaction retries exhausted"
                );
                self.alerts.notify(Alert::new(
                    "webhook.retries_exhausted",
                    Severity::Critical,
                    "Webhook could not be applied; provider will redeliver",
                    json!({
                        "event_id": event.id,
                        "event_type": event.event_type,
                        "intent_id": intent_id,
                        "error": err.to_string(),
                    }),
                ));
                WebhookError::RetriesExhausted(err)
            }
            WebhookError::Store(err) => {
                tracing::error!(event_id = %event.id, intent_id = %intent_id, error = %err, "Webhook store failure");
                self.alerts.notify(Alert::new(
                    "webhook.store_error",
                    Severity::High,
                    "Webhook processing failed",
                    json!({
                        "event_id": event.id,
                        "intent_id": intent_id,
                        "error": err.to_string(),
                    }),
                ));
                WebhookError::Store(err)
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use guidepay_core::commission::CommissionRate;
    use guidepay_runtime::retry::RetryPolicy;
    use guidepay_testing::{
        InMemoryJobQueue, InMemoryLedger, RecordingAlertSink, RowLock, eventually, fixtures,
        test_clock,
    };
    use std::time::Duration;

    const SECRET: &str = "whsec_test";

    struct Harness {
        ledger: InMemoryLedger,
        queue: Arc<InMemoryJobQueue>,
        alerts: Arc<RecordingAlertSink>,
        processor: WebhookProcessor<InMemoryLedger>,
    }

    fn harness() -> Harness {
        let ledger = InMemoryLedger::new();
        let queue = Arc::new(InMemoryJobQueue::default());
        let alerts = Arc::new(RecordingAlertSink::new());
        let config = WebhookConfig {
            signing_secret: SECRET.to_string(),
            commission_rate: CommissionRate::from_bps(1_500),
            retry: RetryPolicy::builder()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(1))
                .jitter(0.0)
                .build(),
            ..WebhookConfig::default()
        };
        let processor = WebhookProcessor::new(
            ledger.clone(),
            queue.clone(),
            alerts.clone(),
            Arc::new(test_clock()),
            config,
        );
        Harness {
            ledger,
            queue,
            alerts,
            processor,
        }
    }

    async fn seed(ledger: &InMemoryLedger, intent_id: &str) {
        let mut booking = fixtures::booking_row(1, 2000);
        booking.payment_intent_id = Some(intent_id.to_string());
        booking.payment_status = BookingPaymentStatus::RequiresPayment;
        ledger.seed_booking(booking).await;
        ledger
            .seed_payment(
                fixtures::new_payment(BookingId::new(1), intent_id, 2000)
                    .into_payment(PaymentId::new(1)),
            )
            .await;
    }

    fn event(event_type: &str, intent_id: &str) -> (Vec<u8>, String) {
        let body = serde_json::to_vec(&json!({
            "id": format!("evt_{event_type}"),
            "type": event_type,
            "data": { "object": { "id": intent_id, "amount": 2000 } }
        }))
        .unwrap();
        let header = signature::sign(&body, SECRET, test_clock().now().timestamp()).unwrap();
        (body, header)
    }

    #[tokio::test]
    async fn success_confirms_booking_and_settles_commission() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        let (body, header) = event("payment_intent.succeeded", "pi_1");

        let outcome = h.processor.handle(&body, &header).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let booking = h.ledger.find_booking(BookingId::new(1)).await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(booking.payment_status, BookingPaymentStatus::Paid);

        let commissions = h.ledger.commissions().await;
        assert_eq!(commissions.len(), 1);
        assert_eq!(commissions[0].split.platform_amount, Money::from_minor(300));
        assert_eq!(commissions[0].split.guide_amount, Money::from_minor(1700));
        assert_eq!(commissions[0].status, CommissionStatus::Settled);

        let earnings = h.ledger.guide_earnings(booking.guide_id).await.unwrap();
        assert_eq!(earnings.total_earnings, Money::from_minor(1700));

        let payment = h.ledger.payments().await.remove(0);
        assert!(matches!(payment.provider_payload, Some(ProviderPayload::Webhook(_))));

        assert!(eventually(Duration::from_secs(1), || h.queue.jobs().len() == 4).await);
    }

    #[tokio::test]
    async fn success_locks_booking_before_payment() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        let (body, header) = event("payment_intent.succeeded", "pi_1");

        h.processor.handle(&body, &header).await.unwrap();

        assert_eq!(
            h.ledger.lock_log(),
            vec![
                RowLock::Booking(BookingId::new(1)),
                RowLock::Payment("pi_1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn redelivery_is_absorbed() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        let (body, header) = event("payment_intent.succeeded", "pi_1");

        h.processor.handle(&body, &header).await.unwrap();
        let commits = h.ledger.commit_count();
        let again = h.processor.handle(&body, &header).await.unwrap();

        assert_eq!(again, WebhookOutcome::AlreadyProcessed);
        assert_eq!(h.ledger.commit_count(), commits);
        assert_eq!(h.ledger.commissions().await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_signature_touches_nothing() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        let (body, _) = event("payment_intent.succeeded", "pi_1");
        let forged = signature::sign(&body, "whsec_wrong", test_clock().now().timestamp()).unwrap();

        let err = h.processor.handle(&body, &forged).await.unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature(SignatureError::Mismatch)));
        assert_eq!(err.http_status(), 400);
        assert_eq!(h.ledger.commit_count(), 0);
    }

    #[tokio::test]
    async fn unknown_intent_and_event_type_are_acknowledged() {
        let h = harness();
        let (body, header) = event("payment_intent.succeeded", "pi_missing");
        assert_eq!(
            h.processor.handle(&body, &header).await.unwrap(),
            WebhookOutcome::NoOp(NoOpReason::UnknownPayment)
        );

        let (body, header) = event("charge.refunded", "pi_missing");
        assert_eq!(
            h.processor.handle(&body, &header).await.unwrap(),
            WebhookOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn failure_marks_payment_and_triggers_reconciliation() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        let (body, header) = event("payment_intent.payment_failed", "pi_1");

        assert_eq!(
            h.processor.handle(&body, &header).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(h.ledger.payments().await[0].status, PaymentStatus::Failed);
        let booking = h.ledger.find_booking(BookingId::new(1)).await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);

        assert_eq!(h.alerts.with_key("webhook.payment_failed").len(), 1);
        assert!(
            eventually(Duration::from_secs(1), || {
                h.queue.keys() == vec!["reconciliation:payment-failed:1".to_string()]
            })
            .await
        );
    }

    #[tokio::test]
    async fn late_failure_never_downgrades_success() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        let (ok_body, ok_header) = event("payment_intent.succeeded", "pi_1");
        let (fail_body, fail_header) = event("payment_intent.payment_failed", "pi_1");

        h.processor.handle(&ok_body, &ok_header).await.unwrap();
        let outcome = h.processor.handle(&fail_body, &fail_header).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::NoOp(NoOpReason::AlreadySucceeded));
        assert_eq!(h.ledger.payments().await[0].status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn processing_only_advances_from_initiated() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        let (body, header) = event("payment_intent.processing", "pi_1");

        assert_eq!(
            h.processor.handle(&body, &header).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(h.ledger.payments().await[0].status, PaymentStatus::Processing);
        assert_eq!(
            h.processor.handle(&body, &header).await.unwrap(),
            WebhookOutcome::AlreadyProcessed
        );

        let (body, header) = event("payment_intent.payment_failed", "pi_1");
        h.processor.handle(&body, &header).await.unwrap();
        let (body, header) = event("payment_intent.processing", "pi_1");
        assert_eq!(
            h.processor.handle(&body, &header).await.unwrap(),
            WebhookOutcome::NoOp(NoOpReason::StalePaymentState)
        );
    }

    #[tokio::test]
    async fn success_for_cancelled_booking_raises_critical_alert() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        let mut booking = h.ledger.find_booking(BookingId::new(1)).await.unwrap().unwrap();
        booking.status = BookingStatus::Cancelled;
        h.ledger.seed_booking(booking).await;

        let (body, header) = event("payment_intent.succeeded", "pi_1");
        assert_eq!(
            h.processor.handle(&body, &header).await.unwrap(),
            WebhookOutcome::Processed
        );

        assert_eq!(h.ledger.payments().await[0].status, PaymentStatus::Succeeded);
        let booking = h.ledger.find_booking(BookingId::new(1)).await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Cancelled);
        assert!(h.ledger.commissions().await.is_empty());
        assert_eq!(h.alerts.at_least(Severity::Critical).len(), 1);
    }

    #[tokio::test]
    async fn contention_is_retried_then_escalated() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        let (body, header) = event("payment_intent.succeeded", "pi_1");

        h.ledger.inject_commit_failures(2);
        assert_eq!(
            h.processor.handle(&body, &header).await.unwrap(),
            WebhookOutcome::Processed
        );

        let h = harness();
        seed(&h.ledger, "pi_1").await;
        h.ledger.inject_commit_failures(3);
        let err = h.processor.handle(&body, &header).await.unwrap_err();

        assert!(matches!(err, WebhookError::RetriesExhausted(_)));
        assert_eq!(err.http_status(), 500);
        assert_eq!(h.alerts.with_key("webhook.retries_exhausted").len(), 1);
        assert!(h.ledger.commissions().await.is_empty());
    }

    #[tokio::test]
    async fn missing_guide_counters_are_tolerated() {
        let h = harness();
        seed(&h.ledger, "pi_1").await;
        h.ledger.set_guide_stats_available(false);
        let (body, header) = event("payment_intent.succeeded", "pi_1");

        assert_eq!(
            h.processor.handle(&body, &header).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(h.ledger.commissions().await.len(), 1);
    }
}
