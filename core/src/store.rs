//! Relational store ports.
//!
//! The ledger (bookings, payments, commissions) is the sole authoritative
//! mutation path. Every mutation happens inside a [`LedgerTx`], and every read
//! that feeds a mutation goes through one of its `lock_*` methods, which take a
//! row-level exclusive lock (`SELECT ... FOR UPDATE`) held until commit or
//! rollback.
//!
//! A transaction that is dropped without [`LedgerTx::commit`] is rolled back.
//! Once opened, a transaction must run to commit or rollback: callers never
//! abandon one mid-flight.

use crate::booking::{Booking, NewBooking};
use crate::commission::{Commission, CommissionUpsert};
use crate::error::StoreError;
use crate::fraud::{ActivitySnapshot, FraudEvent};
use crate::payment::{NewPayment, Payment};
use crate::reconciliation::{
    BookingAuditRow, DuplicateIntent, PaymentAuditRow, ReconciliationFinding, RunCheckpoint,
};
use crate::types::{BookingId, GuideId, Money, PaymentId, RunId, TimeWindow, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Entry point to the ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Transaction handle produced by [`LedgerStore::begin`].
    type Tx: LedgerTx + 'static;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if no connection is available.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Unlocked read of a booking.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Unlocked read of the lowest-id payment carrying `intent_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn find_payment_by_intent(&self, intent_id: &str)
    -> Result<Option<Payment>, StoreError>;

    /// Unlocked read of a booking's commission.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn find_commission(&self, booking_id: BookingId)
    -> Result<Option<Commission>, StoreError>;

    /// All payments of a booking, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn payments_for_booking(&self, booking_id: BookingId)
    -> Result<Vec<Payment>, StoreError>;
}

/// An open ledger transaction.
#[async_trait]
pub trait LedgerTx: Send {
    /// Serialise schedule changes for one guide until the transaction ends.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] on lock timeout.
    async fn lock_guide_schedule(&mut self, guide_id: GuideId) -> Result<(), StoreError>;

    /// Ids of the guide's slot-holding bookings overlapping `window`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn find_overlapping_bookings(
        &mut self,
        guide_id: GuideId,
        window: &TimeWindow,
    ) -> Result<Vec<BookingId>, StoreError>;

    /// Insert a `pending` booking.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    async fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, StoreError>;

    /// Lock and read a booking.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the lock cannot be taken.
    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Persist a booking's mutable columns.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    async fn update_booking(&mut self, booking: &Booking) -> Result<(), StoreError>;

    /// Lock and read the booking's active payment, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the lock cannot be taken.
    async fn lock_active_payment(
        &mut self,
        booking_id: BookingId,
    ) -> Result<Option<Payment>, StoreError>;

    /// Lock and read the lowest-id payment carrying `intent_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the lock cannot be taken.
    async fn lock_payment_by_intent(
        &mut self,
        intent_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Insert a payment row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] if another active payment exists for the booking.
    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment, StoreError>;

    /// Persist a payment's mutable columns.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    async fn update_payment(&mut self, payment: &Payment) -> Result<(), StoreError>;

    /// Lock and read a booking's commission.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the lock cannot be taken.
    async fn lock_commission(
        &mut self,
        booking_id: BookingId,
    ) -> Result<Option<Commission>, StoreError>;

    /// Insert or overwrite a booking's commission.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the upsert fails.
    async fn upsert_commission(&mut self, upsert: CommissionUpsert)
    -> Result<Commission, StoreError>;

    /// Best-effort bump of the guide's denormalised earnings counters.
    ///
    /// Returns `false` when the counters are unavailable; the enclosing
    /// transaction stays usable either way.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only if the enclosing transaction itself is broken.
    async fn record_guide_earnings(
        &mut self,
        guide_id: GuideId,
        booking_id: BookingId,
        amount: Money,
    ) -> Result<bool, StoreError>;

    /// Commit and release all locks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; nothing was applied.
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard all changes and release all locks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the rollback could not be sent.
    async fn rollback(self) -> Result<(), StoreError>;
}

/// Read-only audit queries plus the finding/checkpoint tables.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Payments created since `since` with id greater than `after`, joined to
    /// their booking, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn scan_payments(
        &self,
        since: DateTime<Utc>,
        after: Option<PaymentId>,
        limit: u32,
    ) -> Result<Vec<PaymentAuditRow>, StoreError>;

    /// Bookings created since `since` that reference an intent or are marked
    /// paid, with id greater than `after`, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn scan_bookings(
        &self,
        since: DateTime<Utc>,
        after: Option<BookingId>,
        limit: u32,
    ) -> Result<Vec<BookingAuditRow>, StoreError>;

    /// Intent ids shared by more than one payment created since `since`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn find_duplicate_intents(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<DuplicateIntent>, StoreError>;

    /// Insert a finding, or overwrite the one with the same run/anomaly/entity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the upsert fails.
    async fn upsert_finding(&self, finding: &ReconciliationFinding) -> Result<(), StoreError>;

    /// Stored checkpoint of a run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn load_checkpoint(&self, run_id: RunId) -> Result<Option<RunCheckpoint>, StoreError>;

    /// Persist a run checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<(), StoreError>;

    /// Findings of a run, ordered by detection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    async fn findings_for_run(&self, run_id: RunId)
    -> Result<Vec<ReconciliationFinding>, StoreError>;
}

/// Activity reads and audit writes for fraud scoring.
#[async_trait]
pub trait FraudStore: Send + Sync {
    /// Recent activity of `user_id` as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any underlying query fails.
    async fn activity_snapshot(
        &self,
        user_id: UserId,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ActivitySnapshot, StoreError>;

    /// Append an assessment to the audit trail.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    async fn record_fraud_event(&self, event: &FraudEvent) -> Result<(), StoreError>;
}
