//! Booking conflict checker and atomic creator.
//!
//! A booking is created `pending` inside one transaction that first serialises
//! the guide's schedule and then checks for overlapping slot-holding bookings.
//! No payment intent is created here.

use crate::config::BookingConfig;
use chrono::{DateTime, Utc};
use guidepay_core::booking::{Booking, BookingStatus, NewBooking};
use guidepay_core::environment::Clock;
use guidepay_core::error::{ErrorKind, StoreError};
use guidepay_core::guide::{DirectoryError, GuideDirectory};
use guidepay_core::pricing::{AddOn, Pricing};
use guidepay_core::store::{LedgerStore, LedgerTx};
use guidepay_core::types::{BookingId, GuideId, TimeWindow, UserId};
use guidepay_runtime::metrics::BookingMetrics;
use guidepay_runtime::retry::retry_with_predicate;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// A customer's request for a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBookingRequest {
    /// Customer
    pub user_id: UserId,
    /// Guide to book
    pub guide_id: GuideId,
    /// Slot start
    pub start: DateTime<Utc>,
    /// Slot length in minutes
    pub duration_minutes: u32,
    /// Free-form notes
    pub notes: Option<String>,
    /// Extras priced on top of the base rate
    pub add_ons: Vec<AddOn>,
}

/// Booking creation and status change failures.
#[derive(Error, Debug)]
pub enum BookingError {
    /// Request failed validation
    #[error("Invalid booking request: {0}")]
    Validation(String),

    /// Guide does not exist
    #[error("Guide {0} not found")]
    GuideNotFound(GuideId),

    /// Guide is inactive or not accepting bookings
    #[error("Guide {0} is not accepting bookings")]
    GuideUnavailable(GuideId),

    /// Booking does not exist
    #[error("Booking {0} not found")]
    NotFound(BookingId),

    /// Slot overlaps existing bookings of the same guide
    #[error("BOOKING_CONFLICT: slot overlaps {} existing booking(s)", .conflicting.len())]
    Conflict {
        /// Bookings holding the slot
        conflicting: Vec<BookingId>,
    },

    /// Status change is not an edge of the status DAG
    #[error("Cannot move booking from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: BookingStatus,
        /// Requested status
        to: BookingStatus,
        /// Statuses reachable from `from`
        allowed: Vec<BookingStatus>,
    },

    /// Guide state could not be read
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Store failure (after retries, if retryable)
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BookingError {
    /// Classification for propagation.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::GuideNotFound(_) | Self::GuideUnavailable(_) => {
                ErrorKind::Validation
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict { .. } | Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::Directory(_) => ErrorKind::Transient,
            Self::Store(err) => err.kind(),
        }
    }

    /// HTTP status for the caller.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "INVALID_REQUEST",
            Self::GuideNotFound(_) => "GUIDE_NOT_FOUND",
            Self::GuideUnavailable(_) => "GUIDE_UNAVAILABLE",
            Self::NotFound(_) => "BOOKING_NOT_FOUND",
            Self::Conflict { .. } => "BOOKING_CONFLICT",
            Self::InvalidTransition { .. } => "INVALID_STATUS_TRANSITION",
            Self::Directory(_) => "GUIDE_DIRECTORY_UNAVAILABLE",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    fn is_retryable_store_error(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}

/// Creates bookings and applies administrative status changes.
pub struct BookingService<S: LedgerStore> {
    store: S,
    directory: Arc<dyn GuideDirectory>,
    pricing: Arc<dyn Pricing>,
    clock: Arc<dyn Clock>,
    config: BookingConfig,
}

impl<S: LedgerStore> BookingService<S> {
    /// Create a booking service.
    #[must_use]
    pub fn new(
        store: S,
        directory: Arc<dyn GuideDirectory>,
        pricing: Arc<dyn Pricing>,
        clock: Arc<dyn Clock>,
        config: BookingConfig,
    ) -> Self {
        Self {
            store,
            directory,
            pricing,
            clock,
            config,
        }
    }

    /// Create a `pending` booking if the slot is free.
    ///
    /// 1. Validate the request
    /// 2. Read the guide and price the slot
    /// 3. In one transaction: lock the guide schedule, check overlaps, insert
    ///
    /// Step 3 is retried on lock contention.
    ///
    /// # Errors
    ///
    /// - [`BookingError::Validation`], [`BookingError::GuideNotFound`],
    ///   [`BookingError::GuideUnavailable`] for bad input
    /// - [`BookingError::Conflict`] if the slot overlaps another booking
    /// - [`BookingError::Store`] if the transaction keeps failing
    pub async fn create(&self, request: CreateBookingRequest) -> Result<Booking, BookingError> {
        let started = Instant::now();
        let now = self.clock.now();
        self.validate(&request, now)?;

        let guide = self
            .directory
            .find_guide(request.guide_id)
            .await?
            .ok_or(BookingError::GuideNotFound(request.guide_id))?;
        if !guide.is_bookable() {
            return Err(BookingError::GuideUnavailable(guide.id));
        }

        let window = TimeWindow::new(request.start, request.duration_minutes);
        let price = self.pricing.quote(&guide, &window, &request.add_ons);
        let new_booking = NewBooking {
            user_id: request.user_id,
            guide_id: guide.id,
            window,
            price,
            notes: request.notes,
            created_at: now,
        };

        let result = retry_with_predicate(
            &self.config.retry,
            "booking.create",
            || self.insert_pending(&new_booking),
            BookingError::is_retryable_store_error,
        )
        .await;

        match &result {
            Ok(booking) => {
                BookingMetrics::record_created(started.elapsed());
                tracing::info!(
                    booking_id = %booking.id,
                    guide_id = %booking.guide_id,
                    user_id = %booking.user_id,
                    total = %booking.total(),
                    "Booking created"
                );
            }
            Err(BookingError::Conflict { conflicting }) => {
                BookingMetrics::record_conflict();
                tracing::info!(
                    guide_id = %new_booking.guide_id,
                    start = %new_booking.window.start,
                    conflicts = conflicting.len(),
                    "Booking rejected: slot taken"
                );
            }
            Err(error) => {
                tracing::error!(guide_id = %new_booking.guide_id, error = %error, "Booking creation failed");
            }
        }
        result
    }

    async fn insert_pending(&self, new_booking: &NewBooking) -> Result<Booking, BookingError> {
        let mut tx = self.store.begin().await?;
        tx.lock_guide_schedule(new_booking.guide_id).await?;

        let conflicting = tx
            .find_overlapping_bookings(new_booking.guide_id, &new_booking.window)
            .await?;
        if !conflicting.is_empty() {
            tx.rollback().await?;
            return Err(BookingError::Conflict { conflicting });
        }

        let booking = tx.insert_booking(new_booking.clone()).await?;
        tx.commit().await?;
        Ok(booking)
    }

    /// Move a booking along the status DAG (administrative path).
    ///
    /// # Errors
    ///
    /// - [`BookingError::NotFound`] if the booking does not exist
    /// - [`BookingError::InvalidTransition`] if `target` is not reachable
    /// - [`BookingError::Store`] if the transaction keeps failing
    pub async fn transition_status(
        &self,
        booking_id: BookingId,
        target: BookingStatus,
    ) -> Result<Booking, BookingError> {
        let booking = retry_with_predicate(
            &self.config.retry,
            "booking.transition",
            || self.apply_transition(booking_id, target),
            BookingError::is_retryable_store_error,
        )
        .await?;

        tracing::info!(booking_id = %booking_id, status = %booking.status, "Booking status changed");
        Ok(booking)
    }

    async fn apply_transition(
        &self,
        booking_id: BookingId,
        target: BookingStatus,
    ) -> Result<Booking, BookingError> {
        let mut tx = self.store.begin().await?;
        let mut booking = tx
            .lock_booking(booking_id)
            .await?
            .ok_or(BookingError::NotFound(booking_id))?;

        if let Err(invalid) = booking.transition_to(target, self.clock.now()) {
            tx.rollback().await?;
            return Err(BookingError::InvalidTransition {
                from: invalid.from,
                to: invalid.to,
                allowed: invalid.allowed().to_vec(),
            });
        }

        tx.update_booking(&booking).await?;
        tx.commit().await?;
        Ok(booking)
    }

    fn validate(&self, request: &CreateBookingRequest, now: DateTime<Utc>) -> Result<(), BookingError> {
        let config = &self.config;
        let minutes = request.duration_minutes;
        if minutes < config.min_duration_minutes || minutes > config.max_duration_minutes {
            return Err(BookingError::Validation(format!(
                "duration must be between {} and {} minutes",
                config.min_duration_minutes, config.max_duration_minutes
            )));
        }
        if config.duration_step_minutes > 0 && minutes % config.duration_step_minutes != 0 {
            return Err(BookingError::Validation(format!(
                "duration must be a multiple of {} minutes",
                config.duration_step_minutes
            )));
        }
        if request.start <= now {
            return Err(BookingError::Validation("start must be in the future".to_string()));
        }
        if request
            .notes
            .as_ref()
            .is_some_and(|notes| notes.chars().count() > config.max_notes_chars)
        {
            return Err(BookingError::Validation(format!(
                "notes must be at most {} characters",
                config.max_notes_chars
            )));
        }
        if let Some(add_on) = request.add_ons.iter().find(|a| a.price.minor() < 0) {
            return Err(BookingError::Validation(format!(
                "add-on {} has a negative price",
                add_on.code
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use guidepay_core::Money;
    use guidepay_core::booking::BookingPaymentStatus;
    use guidepay_core::guide::GuideProfile;
    use guidepay_core::pricing::RateCardPricing;
    use guidepay_testing::{InMemoryLedger, StaticGuideDirectory, fixtures, test_clock};

    fn service(ledger: &InMemoryLedger, guide: &GuideProfile) -> BookingService<InMemoryLedger> {
        BookingService::new(
            ledger.clone(),
            Arc::new(StaticGuideDirectory::with_guides([guide.clone()])),
            Arc::new(RateCardPricing::default()),
            Arc::new(test_clock()),
            BookingConfig::default(),
        )
    }

    fn request(guide: &GuideProfile, start: DateTime<Utc>, minutes: u32) -> CreateBookingRequest {
        CreateBookingRequest {
            user_id: UserId::new(),
            guide_id: guide.id,
            start,
            duration_minutes: minutes,
            notes: None,
            add_ons: Vec::new(),
        }
    }

    #[tokio::test]
    async fn creates_pending_booking_with_quoted_price() {
        let ledger = InMemoryLedger::new();
        let guide = fixtures::guide(1000);
        let service = service(&ledger, &guide);

        let booking = service
            .create(request(&guide, fixtures::weekday_morning(), 120))
            .await
            .unwrap();

        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.payment_status, BookingPaymentStatus::Unpaid);
        assert_eq!(booking.total(), Money::from_minor(2000));
        assert!(booking.payment_intent_id.is_none());
        assert_eq!(ledger.bookings().await.len(), 1);
    }

    #[tokio::test]
    async fn overlapping_slot_is_a_conflict() {
        let ledger = InMemoryLedger::new();
        let guide = fixtures::guide(1000);
        let service = service(&ledger, &guide);
        let start = fixtures::weekday_morning();

        let first = service.create(request(&guide, start, 120)).await.unwrap();
        let err = service
            .create(request(&guide, start + chrono::Duration::minutes(60), 60))
            .await
            .unwrap_err();

        assert!(matches!(&err, BookingError::Conflict { conflicting } if conflicting == &vec![first.id]));
        assert_eq!(err.http_status(), 409);
        assert_eq!(err.code(), "BOOKING_CONFLICT");
    }

    #[tokio::test]
    async fn adjacent_and_cancelled_slots_are_free() {
        let ledger = InMemoryLedger::new();
        let guide = fixtures::guide(1000);
        let service = service(&ledger, &guide);
        let start = fixtures::weekday_morning();

        let first = service.create(request(&guide, start, 60)).await.unwrap();
        service
            .create(request(&guide, start + chrono::Duration::minutes(60), 60))
            .await
            .unwrap();

        service
            .transition_status(first.id, BookingStatus::Cancelled)
            .await
            .unwrap();
        service.create(request(&guide, start, 60)).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_durations_and_past_slots() {
        let ledger = InMemoryLedger::new();
        let guide = fixtures::guide(1000);
        let service = service(&ledger, &guide);
        let start = fixtures::weekday_morning();

        for minutes in [15, 50, 735] {
            let err = service.create(request(&guide, start, minutes)).await.unwrap_err();
            assert!(matches!(err, BookingError::Validation(_)), "{minutes}");
        }
        let past = test_clock().now() - chrono::Duration::hours(1);
        let err = service.create(request(&guide, past, 60)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn unavailable_guide_is_rejected() {
        let ledger = InMemoryLedger::new();
        let guide = GuideProfile {
            is_available: false,
            ..fixtures::guide(1000)
        };
        let service = service(&ledger, &guide);

        let err = service
            .create(request(&guide, fixtures::weekday_morning(), 60))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::GuideUnavailable(_)));

        let stranger = fixtures::guide(1000);
        let err = service
            .create(request(&stranger, fixtures::weekday_morning(), 60))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::GuideNotFound(_)));
    }

    #[tokio::test]
    async fn contention_is_retried_once() {
        let ledger = InMemoryLedger::new();
        let guide = fixtures::guide(1000);
        let service = service(&ledger, &guide);

        ledger.inject_commit_failures(1);
        service
            .create(request(&guide, fixtures::weekday_morning(), 60))
            .await
            .unwrap();

        ledger.inject_commit_failures(2);
        let err = service
            .create(request(&guide, fixtures::saturday_evening(), 60))
            .await
            .unwrap_err();
        assert!(matches!(&err, BookingError::Store(StoreError::Transient(_))));
        assert!(err.http_status() >= 500);
        assert_eq!(ledger.bookings().await.len(), 1);
    }

    #[tokio::test]
    async fn transitions_follow_the_dag() {
        let ledger = InMemoryLedger::new();
        let guide = fixtures::guide(1000);
        let service = service(&ledger, &guide);
        let booking = service
            .create(request(&guide, fixtures::weekday_morning(), 60))
            .await
            .unwrap();

        let err = service
            .transition_status(booking.id, BookingStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            BookingError::InvalidTransition { from: BookingStatus::Pending, to: BookingStatus::Completed, allowed }
                if allowed == &vec![BookingStatus::Confirmed, BookingStatus::Cancelled]
        ));

        let confirmed = service
            .transition_status(booking.id, BookingStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);

        let err = service
            .transition_status(BookingId::new(999), BookingStatus::Cancelled)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}
