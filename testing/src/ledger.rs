//! In-memory ledger with serialisable transactions.
//!
//! A transaction takes the store-wide lock for its whole lifetime and works on
//! a private copy of the state; commit swaps the copy in, drop discards it. This
//! is stricter than row-level locking (every transaction is serialised), which
//! makes concurrency tests deterministic without weakening any guarantee the
//! engine relies on.

#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use guidepay_core::booking::{Booking, BookingPaymentStatus, NewBooking};
use guidepay_core::commission::{Commission, CommissionUpsert};
use guidepay_core::error::StoreError;
use guidepay_core::fraud::{ActivitySnapshot, FraudEvent};
use guidepay_core::payment::{NewPayment, Payment, PaymentStatus};
use guidepay_core::reconciliation::{
    BookingAuditRow, BookingAuditView, DuplicateIntent, PaymentAuditRow, ReconciliationFinding,
    RunCheckpoint,
};
use guidepay_core::store::{FraudStore, LedgerStore, LedgerTx, ReconciliationStore};
use guidepay_core::types::{BookingId, GuideId, Money, PaymentId, RunId, TimeWindow, UserId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Denormalised guide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuideEarnings {
    /// Paid bookings
    pub paid_bookings: u64,
    /// Sum of guide shares
    pub total_earnings: Money,
}

/// Full contents of the in-memory ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    /// `bookings` table
    pub bookings: BTreeMap<BookingId, Booking>,
    /// `payments` table
    pub payments: BTreeMap<PaymentId, Payment>,
    /// `commissions` table, unique per booking
    pub commissions: BTreeMap<BookingId, Commission>,
    /// `guide_performance` table
    pub guide_earnings: HashMap<GuideId, GuideEarnings>,
    /// `fraud_events` table
    pub fraud_events: Vec<FraudEvent>,
    /// `payment_reconciliation_reports` table
    pub findings: Vec<ReconciliationFinding>,
    /// `reconciliation_runs` table
    pub checkpoints: HashMap<RunId, RunCheckpoint>,
    /// Account creation times (`users.created_at`)
    pub accounts: HashMap<UserId, DateTime<Utc>>,
    next_booking_id: i64,
    next_payment_id: i64,
    next_commission_id: i64,
}

impl LedgerState {
    fn next_booking_id(&mut self) -> BookingId {
        self.next_booking_id += 1;
        BookingId::new(self.next_booking_id)
    }

    fn next_payment_id(&mut self) -> PaymentId {
        self.next_payment_id += 1;
        PaymentId::new(self.next_payment_id)
    }

    /// Payments of a booking, ascending by id.
    #[must_use]
    pub fn payments_of(&self, booking_id: BookingId) -> Vec<&Payment> {
        self.payments
            .values()
            .filter(|p| p.booking_id == booking_id)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Faults {
    locks: std::sync::Mutex<Vec<RowLock>>,
    commit_failures: AtomicU32,
    guide_stats_unavailable: AtomicBool,
    activity_unavailable: AtomicBool,
    fraud_writes_unavailable: AtomicBool,
    commits: AtomicU64,
}

impl Faults {
    fn record_lock(&self, lock: RowLock) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.push(lock);
        }
    }

    fn take_commit_failure(&self) -> bool {
        self.commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// A row lock taken inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowLock {
    /// Booking row
    Booking(BookingId),
    /// Payment row, by intent id
    Payment(String),
}

/// In-memory implementation of every store port.
///
/// Cloning is cheap and clones share state.
///
/// # Example
///
/// ```
/// use guidepay_testing::InMemoryLedger;
/// use guidepay_core::store::{LedgerStore, LedgerTx};
///
/// # async fn example() -> Result<(), guidepay_core::StoreError> {
/// let ledger = InMemoryLedger::new();
/// let tx = ledger.begin().await?;
/// tx.commit().await?;
/// assert_eq!(ledger.commit_count(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    faults: Arc<Faults>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> LedgerState {
        self.state.lock().await.clone()
    }

    /// Committed bookings, ascending by id.
    pub async fn bookings(&self) -> Vec<Booking> {
        self.state.lock().await.bookings.values().cloned().collect()
    }

    /// Committed payments, ascending by id.
    pub async fn payments(&self) -> Vec<Payment> {
        self.state.lock().await.payments.values().cloned().collect()
    }

    /// Committed commissions.
    pub async fn commissions(&self) -> Vec<Commission> {
        self.state.lock().await.commissions.values().cloned().collect()
    }

    /// Recorded findings.
    pub async fn findings(&self) -> Vec<ReconciliationFinding> {
        self.state.lock().await.findings.clone()
    }

    /// Recorded fraud assessments.
    pub async fn fraud_events(&self) -> Vec<FraudEvent> {
        self.state.lock().await.fraud_events.clone()
    }

    /// Counters of one guide.
    pub async fn guide_earnings(&self, guide_id: GuideId) -> Option<GuideEarnings> {
        self.state.lock().await.guide_earnings.get(&guide_id).copied()
    }

    /// Insert a booking row verbatim, bypassing all checks.
    pub async fn seed_booking(&self, booking: Booking) {
        let mut state = self.state.lock().await;
        state.next_booking_id = state.next_booking_id.max(booking.id.get());
        state.bookings.insert(booking.id, booking);
    }

    /// Insert a payment row verbatim, bypassing all checks.
    pub async fn seed_payment(&self, payment: Payment) {
        let mut state = self.state.lock().await;
        state.next_payment_id = state.next_payment_id.max(payment.id.get());
        state.payments.insert(payment.id, payment);
    }

    /// Record when an account was created.
    pub async fn set_account_created(&self, user_id: UserId, at: DateTime<Utc>) {
        self.state.lock().await.accounts.insert(user_id, at);
    }

    /// Make the next `n` commits fail with a serialization error.
    pub fn inject_commit_failures(&self, n: u32) {
        self.faults.commit_failures.store(n, Ordering::SeqCst);
    }

    /// Simulate a missing guide counter table.
    pub fn set_guide_stats_available(&self, available: bool) {
        self.faults
            .guide_stats_unavailable
            .store(!available, Ordering::SeqCst);
    }

    /// Make activity queries fail.
    pub fn set_activity_available(&self, available: bool) {
        self.faults
            .activity_unavailable
            .store(!available, Ordering::SeqCst);
    }

    /// Make fraud event writes fail.
    pub fn set_fraud_writes_available(&self, available: bool) {
        self.faults
            .fraud_writes_unavailable
            .store(!available, Ordering::SeqCst);
    }

    /// Successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.faults.commits.load(Ordering::SeqCst)
    }

    /// Row locks taken so far, in acquisition order across all transactions.
    #[must_use]
    pub fn lock_log(&self) -> Vec<RowLock> {
        self.faults
            .locks
            .lock()
            .map(|locks| locks.clone())
            .unwrap_or_default()
    }
}

/// Open transaction on an [`InMemoryLedger`].
#[derive(Debug)]
pub struct InMemoryTx {
    guard: OwnedMutexGuard<LedgerState>,
    working: LedgerState,
    faults: Arc<Faults>,
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTx {
            guard,
            working,
            faults: Arc::clone(&self.faults),
        })
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.state.lock().await.bookings.get(&id).cloned())
    }

    async fn find_payment_by_intent(
        &self,
        intent_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .payments
            .values()
            .find(|p| p.intent_id == intent_id)
            .cloned())
    }

    async fn find_commission(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<Commission>, StoreError> {
        Ok(self.state.lock().await.commissions.get(&booking_id).cloned())
    }

    async fn payments_for_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Vec<Payment>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .payments_of(booking_id)
            .into_iter()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn lock_guide_schedule(&mut self, _guide_id: GuideId) -> Result<(), StoreError> {
        // The whole store is already locked
        Ok(())
    }

    async fn find_overlapping_bookings(
        &mut self,
        guide_id: GuideId,
        window: &TimeWindow,
    ) -> Result<Vec<BookingId>, StoreError> {
        Ok(self
            .working
            .bookings
            .values()
            .filter(|b| {
                b.guide_id == guide_id && b.status.occupies_slot() && b.window.overlaps(window)
            })
            .map(|b| b.id)
            .collect())
    }

    async fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, StoreError> {
        let id = self.working.next_booking_id();
        let booking = booking.into_booking(id);
        self.working.bookings.insert(id, booking.clone());
        Ok(booking)
    }

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        self.faults.record_lock(RowLock::Booking(id));
        Ok(self.working.bookings.get(&id).cloned())
    }

    async fn update_booking(&mut self, booking: &Booking) -> Result<(), StoreError> {
        match self.working.bookings.get_mut(&booking.id) {
            Some(row) => {
                *row = booking.clone();
                Ok(())
            }
            None => Err(StoreError::Database(format!("booking {} not found", booking.id))),
        }
    }

    async fn lock_active_payment(
        &mut self,
        booking_id: BookingId,
    ) -> Result<Option<Payment>, StoreError> {
        let payment = self
            .working
            .payments
            .values()
            .find(|p| p.booking_id == booking_id && p.status.is_active())
            .cloned();
        if let Some(payment) = &payment {
            self.faults.record_lock(RowLock::Payment(payment.intent_id.clone()));
        }
        Ok(payment)
    }

    async fn lock_payment_by_intent(
        &mut self,
        intent_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        self.faults.record_lock(RowLock::Payment(intent_id.to_string()));
        Ok(self
            .working
            .payments
            .values()
            .find(|p| p.intent_id == intent_id)
            .cloned())
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment, StoreError> {
        if payment.status.is_active()
            && self
                .working
                .payments
                .values()
                .any(|p| p.booking_id == payment.booking_id && p.status.is_active())
        {
            return Err(StoreError::Constraint(
                "payments_one_active_per_booking".to_string(),
            ));
        }
        let id = self.working.next_payment_id();
        let payment = payment.into_payment(id);
        self.working.payments.insert(id, payment.clone());
        Ok(payment)
    }

    async fn update_payment(&mut self, payment: &Payment) -> Result<(), StoreError> {
        match self.working.payments.get_mut(&payment.id) {
            Some(row) => {
                *row = payment.clone();
                Ok(())
            }
            None => Err(StoreError::Database(format!("payment {} not found", payment.id))),
        }
    }

    async fn lock_commission(
        &mut self,
        booking_id: BookingId,
    ) -> Result<Option<Commission>, StoreError> {
        Ok(self.working.commissions.get(&booking_id).cloned())
    }

    async fn upsert_commission(
        &mut self,
        upsert: CommissionUpsert,
    ) -> Result<Commission, StoreError> {
        let existing = self.working.commissions.get(&upsert.booking_id);
        let new_id = if existing.is_some() {
            0
        } else {
            self.working.next_commission_id + 1
        };
        let commission = upsert.apply(existing, new_id);
        if existing.is_none() {
            self.working.next_commission_id = new_id;
        }
        self.working
            .commissions
            .insert(upsert.booking_id, commission.clone());
        Ok(commission)
    }

    async fn record_guide_earnings(
        &mut self,
        guide_id: GuideId,
        _booking_id: BookingId,
        amount: Money,
    ) -> Result<bool, StoreError> {
        if self.faults.guide_stats_unavailable.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let entry = self.working.guide_earnings.entry(guide_id).or_default();
        entry.paid_bookings += 1;
        entry.total_earnings = entry.total_earnings + amount;
        Ok(true)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        if self.faults.take_commit_failure() {
            return Err(StoreError::Transient(
                "could not serialize access due to concurrent update".to_string(),
            ));
        }
        *self.guard = self.working;
        self.faults.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl ReconciliationStore for InMemoryLedger {
    async fn scan_payments(
        &self,
        since: DateTime<Utc>,
        after: Option<PaymentId>,
        limit: u32,
    ) -> Result<Vec<PaymentAuditRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .filter(|p| p.created_at >= since && after.is_none_or(|a| p.id > a))
            .take(limit as usize)
            .map(|p| PaymentAuditRow {
                payment: p.clone(),
                booking: state.bookings.get(&p.booking_id).map(BookingAuditView::from),
            })
            .collect())
    }

    async fn scan_bookings(
        &self,
        since: DateTime<Utc>,
        after: Option<BookingId>,
        limit: u32,
    ) -> Result<Vec<BookingAuditRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .bookings
            .values()
            .filter(|b| {
                b.created_at >= since
                    && after.is_none_or(|a| b.id > a)
                    && (b.payment_intent_id.is_some()
                        || b.payment_status == BookingPaymentStatus::Paid)
            })
            .take(limit as usize)
            .map(|b| BookingAuditRow {
                booking: BookingAuditView::from(b),
                has_payment_for_intent: b.payment_intent_id.as_ref().is_some_and(|intent| {
                    state.payments.values().any(|p| &p.intent_id == intent)
                }),
                has_succeeded_payment: state
                    .payments_of(b.id)
                    .iter()
                    .any(|p| p.status == PaymentStatus::Succeeded),
            })
            .collect())
    }

    async fn find_duplicate_intents(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<DuplicateIntent>, StoreError> {
        let state = self.state.lock().await;
        let mut groups: BTreeMap<&str, Vec<PaymentId>> = BTreeMap::new();
        for payment in state.payments.values().filter(|p| p.created_at >= since) {
            groups.entry(&payment.intent_id).or_default().push(payment.id);
        }
        Ok(groups
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(intent_id, payment_ids)| DuplicateIntent {
                intent_id: intent_id.to_string(),
                payment_ids,
            })
            .collect())
    }

    async fn upsert_finding(&self, finding: &ReconciliationFinding) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.findings.iter_mut().find(|f| {
            f.run_id == finding.run_id
                && f.anomaly == finding.anomaly
                && f.entity_key == finding.entity_key
        }) {
            Some(existing) => *existing = finding.clone(),
            None => state.findings.push(finding.clone()),
        }
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: RunId) -> Result<Option<RunCheckpoint>, StoreError> {
        Ok(self.state.lock().await.checkpoints.get(&run_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .checkpoints
            .insert(checkpoint.run_id, checkpoint.clone());
        Ok(())
    }

    async fn findings_for_run(
        &self,
        run_id: RunId,
    ) -> Result<Vec<ReconciliationFinding>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .findings
            .iter()
            .filter(|f| f.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FraudStore for InMemoryLedger {
    async fn activity_snapshot(
        &self,
        user_id: UserId,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ActivitySnapshot, StoreError> {
        if self.faults.activity_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("activity query timed out".to_string()));
        }
        let state = self.state.lock().await;
        let own_bookings: HashSet<BookingId> = state
            .bookings
            .values()
            .filter(|b| b.user_id == user_id)
            .map(|b| b.id)
            .collect();
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);

        let bookings_last_hour = state
            .bookings
            .values()
            .filter(|b| b.user_id == user_id && b.created_at > now - Duration::hours(1))
            .count();
        let recent_payments: Vec<&Payment> = state
            .payments
            .values()
            .filter(|p| own_bookings.contains(&p.booking_id))
            .filter(|p| p.created_at > now - Duration::hours(24))
            .collect();
        let failed = recent_payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Failed)
            .count();
        let burst = recent_payments
            .iter()
            .filter(|p| p.created_at > now - Duration::minutes(10))
            .count();

        let baseline: Vec<Money> = state
            .bookings
            .values()
            .filter(|b| b.user_id == user_id && b.created_at > now - Duration::days(90))
            .map(Booking::total)
            .collect();
        let baseline_amount = i64::try_from(baseline.len())
            .ok()
            .filter(|n| *n > 0)
            .map(|n| Money::from_minor(baseline.iter().copied().sum::<Money>().minor() / n));

        let users_sharing_ip = ip_address.map_or(0, |ip| {
            state
                .fraud_events
                .iter()
                .filter(|e| {
                    e.ip_address.as_deref() == Some(ip)
                        && e.user_id != user_id
                        && e.created_at > now - Duration::hours(24)
                })
                .map(|e| e.user_id)
                .collect::<HashSet<_>>()
                .len()
        });

        Ok(ActivitySnapshot {
            bookings_last_hour: count(bookings_last_hour),
            payments_last_day: count(recent_payments.len()),
            failed_payments_last_day: count(failed),
            payment_attempts_last_10m: count(burst),
            baseline_amount,
            account_created_at: state.accounts.get(&user_id).copied(),
            users_sharing_ip: count(users_sharing_ip),
            captured_at: now,
        })
    }

    async fn record_fraud_event(&self, event: &FraudEvent) -> Result<(), StoreError> {
        if self.faults.fraud_writes_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("fraud_events insert timed out".to_string()));
        }
        self.state.lock().await.fraud_events.push(event.clone());
        Ok(())
    }
}
