//! Payment intent idempotency manager.
//!
//! Guarantees at most one active charge intent per booking under retries and
//! concurrent requests. Two independent defences:
//!
//! - the booking row and its active payment are locked for the whole
//!   check-then-create sequence, so concurrent callers serialise
//! - the provider receives an idempotency key derived only from the booking id,
//!   so a retried create (after a timeout, or from another instance) returns the
//!   intent created first
//!
//! If the provider call fails, the transaction is rolled back and no payment
//! row is persisted.

use crate::config::IntentConfig;
use guidepay_core::booking::{BookingPaymentStatus, BookingStatus};
use guidepay_core::environment::Clock;
use guidepay_core::error::{ErrorKind, StoreError};
use guidepay_core::payment::{NewPayment, ProviderPayload};
use guidepay_core::provider::{CreateIntentRequest, PaymentProvider, ProviderError, ProviderIntent};
use guidepay_core::store::{LedgerStore, LedgerTx};
use guidepay_core::types::{BookingId, PaymentId};
use guidepay_runtime::metrics::IntentMetrics;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Provider idempotency key for a booking's charge intent.
#[must_use]
pub fn idempotency_key(booking_id: BookingId) -> String {
    format!("booking-{booking_id}-intent")
}

/// Intent returned to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentResult {
    /// Booking being paid
    pub booking_id: BookingId,
    /// Payment row tracking the intent
    pub payment_id: PaymentId,
    /// Provider view of the intent
    pub intent: ProviderIntent,
    /// An existing active intent was returned instead of creating one
    pub reused: bool,
}

/// Intent creation failures.
#[derive(Error, Debug)]
pub enum IntentError {
    /// Booking does not exist
    #[error("Booking {0} not found")]
    BookingNotFound(BookingId),

    /// Booking is already paid
    #[error("Booking {0} is already paid")]
    AlreadyPaid(BookingId),

    /// Booking is not awaiting payment
    #[error("Booking {booking_id} cannot be paid in status {status}")]
    NotPayable {
        /// Booking
        booking_id: BookingId,
        /// Its status
        status: BookingStatus,
    },

    /// Provider call failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntentError {
    /// Classification for propagation.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BookingNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyPaid(_) | Self::NotPayable { .. } => ErrorKind::Conflict,
            Self::Provider(err) if err.is_retryable() => ErrorKind::Transient,
            Self::Provider(_) => ErrorKind::Permanent,
            Self::Store(err) => err.kind(),
        }
    }

    /// HTTP status for the caller.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    /// Whether the client should retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Creates or reuses the charge intent of a booking.
pub struct IntentManager<S: LedgerStore> {
    store: S,
    provider: Arc<dyn PaymentProvider>,
    clock: Arc<dyn Clock>,
    config: IntentConfig,
}

impl<S: LedgerStore> IntentManager<S> {
    /// Create an intent manager.
    #[must_use]
    pub fn new(
        store: S,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
        config: IntentConfig,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            config,
        }
    }

    /// Return the booking's active intent, creating it if none exists.
    ///
    /// 1. Lock the booking, then its active payment
    /// 2. Active payment found: point the booking at it, commit, then fetch the
    ///    intent from the provider (`reused = true`)
    /// 3. Otherwise: create the intent at the provider, insert the payment,
    ///    update the booking, commit (`reused = false`)
    ///
    /// # Errors
    ///
    /// - [`IntentError::BookingNotFound`], [`IntentError::AlreadyPaid`],
    ///   [`IntentError::NotPayable`] for bookings that cannot be charged
    /// - [`IntentError::Provider`] if the provider times out or refuses; nothing
    ///   is persisted in that case
    /// - [`IntentError::Store`] on database failure
    pub async fn create_or_reuse(&self, booking_id: BookingId) -> Result<IntentResult, IntentError> {
        let mut tx = self.store.begin().await?;
        let mut booking = tx
            .lock_booking(booking_id)
            .await?
            .ok_or(IntentError::BookingNotFound(booking_id))?;

        if booking.payment_status == BookingPaymentStatus::Paid {
            return Err(IntentError::AlreadyPaid(booking_id));
        }
        if booking.status != BookingStatus::Pending {
            return Err(IntentError::NotPayable {
                booking_id,
                status: booking.status,
            });
        }

        let now = self.clock.now();

        if let Some(active) = tx.lock_active_payment(booking_id).await? {
            booking.payment_intent_id = Some(active.intent_id.clone());
            booking.payment_status = BookingPaymentStatus::RequiresPayment;
            booking.updated_at = now;
            tx.update_booking(&booking).await?;
            tx.commit().await?;

            let intent = self
                .bounded(self.provider.retrieve_intent(&active.intent_id))
                .await
                .inspect_err(|_| IntentMetrics::record_provider_error())?;

            IntentMetrics::record_reused();
            tracing::info!(
                booking_id = %booking_id,
                payment_id = %active.id,
                intent_id = %intent.id,
                "Reused active payment intent"
            );
            return Ok(IntentResult {
                booking_id,
                payment_id: active.id,
                intent,
                reused: true,
            });
        }

        let request = CreateIntentRequest {
            amount: booking.total(),
            currency: self.config.currency.clone(),
            metadata: BTreeMap::from([
                ("booking_id".to_string(), booking_id.to_string()),
                ("user_id".to_string(), booking.user_id.to_string()),
                ("guide_id".to_string(), booking.guide_id.to_string()),
            ]),
            idempotency_key: idempotency_key(booking_id),
        };

        let intent = match self.bounded(self.provider.create_intent(request)).await {
            Ok(intent) => intent,
            Err(error) => {
                IntentMetrics::record_provider_error();
                tracing::warn!(booking_id = %booking_id, error = %error, "Intent creation failed at provider");
                tx.rollback().await?;
                return Err(error.into());
            }
        };

        let status = intent.status.to_payment_status();
        let payload = Some(ProviderPayload::Intent(intent.clone()));

        // The provider may hand back an intent we already track (same key after a
        // failed attempt); revive that row instead of duplicating the intent id.
        let payment = match tx.lock_payment_by_intent(&intent.id).await? {
            Some(mut existing) => {
                existing.status = status;
                existing.amount = intent.amount;
                existing.provider_payload = payload;
                existing.updated_at = now;
                tx.update_payment(&existing).await?;
                existing
            }
            None => {
                tx.insert_payment(NewPayment {
                    booking_id,
                    intent_id: intent.id.clone(),
                    amount: intent.amount,
                    currency: intent.currency.clone(),
                    status,
                    provider_payload: payload,
                    created_at: now,
                })
                .await?
            }
        };

        booking.payment_intent_id = Some(intent.id.clone());
        booking.payment_status = BookingPaymentStatus::RequiresPayment;
        booking.updated_at = now;
        tx.update_booking(&booking).await?;
        tx.commit().await?;

        IntentMetrics::record_created();
        tracing::info!(
            booking_id = %booking_id,
            payment_id = %payment.id,
            intent_id = %intent.id,
            amount = %intent.amount,
            "Created payment intent"
        );

        Ok(IntentResult {
            booking_id,
            payment_id: payment.id,
            intent,
            reused: false,
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        with_timeout(self.config.provider_timeout, call).await
    }
}

/// Bound a provider call; an elapsed timeout becomes [`ProviderError::Timeout`].
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(ProviderError::Timeout))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use guidepay_core::payment::PaymentStatus;
    use guidepay_core::provider::ProviderIntentStatus;
    use guidepay_testing::{InMemoryLedger, MockPaymentProvider, RowLock, fixtures, test_clock};

    async fn pending_booking(ledger: &InMemoryLedger) -> BookingId {
        let booking = fixtures::booking_row(1, 2000);
        let id = booking.id;
        ledger.seed_booking(booking).await;
        id
    }

    fn manager(ledger: &InMemoryLedger, provider: &Arc<MockPaymentProvider>) -> IntentManager<InMemoryLedger> {
        IntentManager::new(
            ledger.clone(),
            provider.clone(),
            Arc::new(test_clock()),
            IntentConfig::default(),
        )
    }

    #[tokio::test]
    async fn second_call_reuses_active_intent() {
        let ledger = InMemoryLedger::new();
        let provider = Arc::new(MockPaymentProvider::new());
        let manager = manager(&ledger, &provider);
        let booking_id = pending_booking(&ledger).await;

        let first = manager.create_or_reuse(booking_id).await.unwrap();
        let second = manager.create_or_reuse(booking_id).await.unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.intent.id, second.intent.id);
        assert_eq!(first.payment_id, second.payment_id);
        assert_eq!(provider.create_calls(), 1);
        assert_eq!(provider.retrieve_calls(), 1);

        let booking = ledger.find_booking(booking_id).await.unwrap().unwrap();
        assert_eq!(booking.payment_intent_id.as_deref(), Some(first.intent.id.as_str()));
        assert_eq!(booking.payment_status, BookingPaymentStatus::RequiresPayment);
        assert_eq!(ledger.payments().await.len(), 1);
    }

    #[tokio::test]
    async fn booking_is_locked_before_payment() {
        let ledger = InMemoryLedger::new();
        let provider = Arc::new(MockPaymentProvider::new());
        let manager = manager(&ledger, &provider);
        let booking_id = pending_booking(&ledger).await;

        let first = manager.create_or_reuse(booking_id).await.unwrap();
        manager.create_or_reuse(booking_id).await.unwrap();

        let payment = RowLock::Payment(first.intent.id.clone());
        assert_eq!(
            ledger.lock_log(),
            vec![
                RowLock::Booking(booking_id),
                payment.clone(),
                RowLock::Booking(booking_id),
                payment,
            ]
        );
    }

    #[tokio::test]
    async fn provider_outage_persists_nothing() {
        let ledger = InMemoryLedger::new();
        let provider = Arc::new(MockPaymentProvider::new());
        let manager = manager(&ledger, &provider);
        let booking_id = pending_booking(&ledger).await;

        provider.fail_next_create(ProviderError::Timeout);
        let err = manager.create_or_reuse(booking_id).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.http_status(), 503);
        assert!(ledger.payments().await.is_empty());
        let booking = ledger.find_booking(booking_id).await.unwrap().unwrap();
        assert!(booking.payment_intent_id.is_none());

        let retry = manager.create_or_reuse(booking_id).await.unwrap();
        assert!(!retry.reused);
    }

    #[tokio::test]
    async fn rejection_is_permanent() {
        let ledger = InMemoryLedger::new();
        let provider = Arc::new(MockPaymentProvider::new());
        let manager = manager(&ledger, &provider);
        let booking_id = pending_booking(&ledger).await;

        provider.fail_next_create(ProviderError::Rejected("amount too small".into()));
        let err = manager.create_or_reuse(booking_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn paid_or_unknown_bookings_are_refused() {
        let ledger = InMemoryLedger::new();
        let provider = Arc::new(MockPaymentProvider::new());
        let manager = manager(&ledger, &provider);
        ledger.seed_booking(fixtures::paid_booking_row(7, 2000, "pi_x")).await;

        let err = manager.create_or_reuse(BookingId::new(7)).await.unwrap_err();
        assert!(matches!(err, IntentError::AlreadyPaid(_)));

        let err = manager.create_or_reuse(BookingId::new(8)).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
        assert_eq!(provider.create_calls(), 0);
    }

    #[tokio::test]
    async fn failed_attempt_revives_same_intent_row() {
        let ledger = InMemoryLedger::new();
        let provider = Arc::new(MockPaymentProvider::new());
        let manager = manager(&ledger, &provider);
        let booking_id = pending_booking(&ledger).await;

        let first = manager.create_or_reuse(booking_id).await.unwrap();
        let mut payment = ledger.payments().await.remove(0);
        payment.status = PaymentStatus::Failed;
        ledger.seed_payment(payment).await;
        provider.set_status(&first.intent.id, ProviderIntentStatus::RequiresPaymentMethod);

        let again = manager.create_or_reuse(booking_id).await.unwrap();
        assert!(!again.reused);
        assert_eq!(again.intent.id, first.intent.id);
        assert_eq!(again.payment_id, first.payment_id);

        let payments = ledger.payments().await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Initiated);
    }
}
