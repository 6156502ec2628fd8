//! Ledger store over `PostgreSQL`.
//!
//! Every `lock_*` read is a `SELECT ... FOR UPDATE`; guide schedules are
//! serialised with a transaction-scoped advisory lock keyed on the guide id.
//! Each transaction sets a local `lock_timeout`, so contention surfaces as
//! SQLSTATE `55P03` and is classified retryable.

use crate::error::{narrow, store_error};
use crate::rows::{self, BOOKING_COLUMNS, COMMISSION_COLUMNS, PAYMENT_COLUMNS};
use async_trait::async_trait;
use guidepay_core::booking::{Booking, BookingStatus, NewBooking};
use guidepay_core::commission::{Commission, CommissionUpsert};
use guidepay_core::error::StoreError;
use guidepay_core::payment::{NewPayment, Payment, PaymentStatus};
use guidepay_core::store::{LedgerStore, LedgerTx};
use guidepay_core::types::{BookingId, GuideId, Money, TimeWindow};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

/// Statuses whose rows are active payments.
fn active_payment_statuses() -> Vec<String> {
    PaymentStatus::ALL
        .iter()
        .filter(|s| s.is_active())
        .map(|s| s.as_str().to_string())
        .collect()
}

/// Statuses whose bookings hold their slot.
fn slot_holding_statuses() -> Vec<String> {
    BookingStatus::ALL
        .iter()
        .filter(|s| s.occupies_slot())
        .map(|s| s.as_str().to_string())
        .collect()
}

/// `PostgreSQL`-backed ledger.
///
/// # Example
///
/// ```no_run
/// use guidepay_postgres::PgLedgerStore;
/// use guidepay_core::store::{LedgerStore, LedgerTx};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), guidepay_core::StoreError> {
/// let ledger = PgLedgerStore::new(pool);
/// let tx = ledger.begin().await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    /// Default bound on row and advisory lock waits.
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

    /// Create a ledger over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Override the per-transaction lock wait bound.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Recompute a guide's earnings counters from settled commissions.
    ///
    /// The webhook path bumps the counters incrementally and best-effort; this
    /// is the authoritative refresh run by the `guide_stats` queue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the upsert fails.
    pub async fn refresh_guide_stats(&self, guide_id: GuideId) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO guide_performance (guide_id, paid_bookings, total_earnings, last_booking_id, updated_at)
            SELECT $1, COUNT(*), COALESCE(SUM(c.guide_amount), 0)::BIGINT, MAX(b.id), now()
            FROM bookings b
            JOIN commissions c ON c.booking_id = b.id
            WHERE b.guide_id = $1 AND b.payment_status = 'paid'
            ON CONFLICT (guide_id) DO UPDATE
            SET paid_bookings = EXCLUDED.paid_bookings,
                total_earnings = EXCLUDED.total_earnings,
                last_booking_id = EXCLUDED.last_booking_id,
                updated_at = now()
            ",
        )
        .bind(guide_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        tracing::debug!(guide_id = %guide_id, "Guide stats refreshed");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        Ok(PgTx { tx })
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let row = sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.as_ref().map(rows::booking).transpose()
    }

    async fn find_payment_by_intent(
        &self,
        intent_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE intent_id = $1 ORDER BY id LIMIT 1"
        ))
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        row.as_ref().map(rows::payment).transpose()
    }

    async fn find_commission(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<Commission>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM commissions WHERE booking_id = $1"
        ))
        .bind(booking_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        row.as_ref().map(rows::commission).transpose()
    }

    async fn payments_for_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE booking_id = $1 ORDER BY id"
        ))
        .bind(booking_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(rows::payment).collect()
    }
}

/// Open transaction on a [`PgLedgerStore`]. Dropping it rolls back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn lock_guide_schedule(&mut self, guide_id: GuideId) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(guide_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn find_overlapping_bookings(
        &mut self,
        guide_id: GuideId,
        window: &TimeWindow,
    ) -> Result<Vec<BookingId>, StoreError> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            r"
            SELECT id
            FROM bookings
            WHERE guide_id = $1
              AND status = ANY($2)
              AND start_time < $4
              AND start_time + make_interval(mins => duration_minutes) > $3
            ORDER BY id
            FOR UPDATE
            ",
        )
        .bind(guide_id.as_uuid())
        .bind(slot_holding_statuses())
        .bind(window.start)
        .bind(window.end())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(store_error)?;
        Ok(ids.into_iter().map(|(id,)| BookingId::new(id)).collect())
    }

    async fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, StoreError> {
        let duration: i32 = narrow(booking.window.duration_minutes, "duration_minutes")?;
        let row = sqlx::query(&format!(
            r"
            INSERT INTO bookings (
                user_id, guide_id, start_time, duration_minutes, status, payment_status,
                hourly_rate, base_amount, peak_surcharge, weekend_surcharge, add_ons_amount,
                total_amount, notes, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, 'pending', 'unpaid', $5, $6, $7, $8, $9, $10, $11, $12, $12)
            RETURNING {BOOKING_COLUMNS}
            "
        ))
        .bind(booking.user_id.as_uuid())
        .bind(booking.guide_id.as_uuid())
        .bind(booking.window.start)
        .bind(duration)
        .bind(booking.price.hourly_rate.minor())
        .bind(booking.price.base_amount.minor())
        .bind(booking.price.peak_surcharge.minor())
        .bind(booking.price.weekend_surcharge.minor())
        .bind(booking.price.add_ons_amount.minor())
        .bind(booking.price.total.minor())
        .bind(&booking.notes)
        .bind(booking.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_error)?;
        rows::booking(&row)
    }

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?;
        row.as_ref().map(rows::booking).transpose()
    }

    async fn update_booking(&mut self, booking: &Booking) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE bookings
            SET status = $2, payment_status = $3, payment_intent_id = $4, notes = $5, updated_at = $6
            WHERE id = $1
            ",
        )
        .bind(booking.id.get())
        .bind(booking.status.as_str())
        .bind(booking.payment_status.as_str())
        .bind(&booking.payment_intent_id)
        .bind(&booking.notes)
        .bind(booking.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(format!("booking {} not found", booking.id)));
        }
        Ok(())
    }

    async fn lock_active_payment(
        &mut self,
        booking_id: BookingId,
    ) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!(
            r"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE booking_id = $1 AND status = ANY($2)
            ORDER BY id
            LIMIT 1
            FOR UPDATE
            "
        ))
        .bind(booking_id.get())
        .bind(active_payment_statuses())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?;
        row.as_ref().map(rows::payment).transpose()
    }

    async fn lock_payment_by_intent(
        &mut self,
        intent_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE intent_id = $1 ORDER BY id LIMIT 1 FOR UPDATE"
        ))
        .bind(intent_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?;
        row.as_ref().map(rows::payment).transpose()
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment, StoreError> {
        let row = sqlx::query(&format!(
            r"
            INSERT INTO payments (
                booking_id, intent_id, amount, currency, status, provider_payload, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING {PAYMENT_COLUMNS}
            "
        ))
        .bind(payment.booking_id.get())
        .bind(&payment.intent_id)
        .bind(payment.amount.minor())
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(payment.provider_payload.as_ref().map(|p| p.to_json()))
        .bind(payment.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_error)?;
        rows::payment(&row)
    }

    async fn update_payment(&mut self, payment: &Payment) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE payments
            SET status = $2, amount = $3, provider_payload = $4, updated_at = $5
            WHERE id = $1
            ",
        )
        .bind(payment.id.get())
        .bind(payment.status.as_str())
        .bind(payment.amount.minor())
        .bind(payment.provider_payload.as_ref().map(|p| p.to_json()))
        .bind(payment.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(format!("payment {} not found", payment.id)));
        }
        Ok(())
    }

    async fn lock_commission(
        &mut self,
        booking_id: BookingId,
    ) -> Result<Option<Commission>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM commissions WHERE booking_id = $1 FOR UPDATE"
        ))
        .bind(booking_id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error)?;
        row.as_ref().map(rows::commission).transpose()
    }

    async fn upsert_commission(
        &mut self,
        upsert: CommissionUpsert,
    ) -> Result<Commission, StoreError> {
        let rate_bps: i32 = narrow(upsert.split.rate.bps(), "rate_bps")?;
        // A settled commission stays settled and keeps its first settlement time.
        let row = sqlx::query(&format!(
            r"
            INSERT INTO commissions (
                booking_id, gross_amount, rate_bps, platform_amount, guide_amount,
                status, created_at, updated_at, settled_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6::TEXT, $7, $7,
                CASE WHEN $6::TEXT = 'settled' THEN $7 END
            )
            ON CONFLICT (booking_id) DO UPDATE
            SET gross_amount = EXCLUDED.gross_amount,
                rate_bps = EXCLUDED.rate_bps,
                platform_amount = EXCLUDED.platform_amount,
                guide_amount = EXCLUDED.guide_amount,
                status = CASE WHEN commissions.status = 'settled' THEN 'settled' ELSE EXCLUDED.status END,
                updated_at = EXCLUDED.updated_at,
                settled_at = COALESCE(commissions.settled_at, EXCLUDED.settled_at)
            RETURNING {COMMISSION_COLUMNS}
            "
        ))
        .bind(upsert.booking_id.get())
        .bind(upsert.split.gross.minor())
        .bind(rate_bps)
        .bind(upsert.split.platform_amount.minor())
        .bind(upsert.split.guide_amount.minor())
        .bind(upsert.status.as_str())
        .bind(upsert.at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_error)?;
        rows::commission(&row)
    }

    async fn record_guide_earnings(
        &mut self,
        guide_id: GuideId,
        booking_id: BookingId,
        amount: Money,
    ) -> Result<bool, StoreError> {
        sqlx::query("SAVEPOINT guide_earnings")
            .execute(&mut *self.tx)
            .await
            .map_err(store_error)?;

        let bumped = sqlx::query(
            r"
            INSERT INTO guide_performance (guide_id, paid_bookings, total_earnings, last_booking_id, updated_at)
            VALUES ($1, 1, $2, $3, now())
            ON CONFLICT (guide_id) DO UPDATE
            SET paid_bookings = guide_performance.paid_bookings + 1,
                total_earnings = guide_performance.total_earnings + EXCLUDED.total_earnings,
                last_booking_id = EXCLUDED.last_booking_id,
                updated_at = now()
            ",
        )
        .bind(guide_id.as_uuid())
        .bind(amount.minor())
        .bind(booking_id.get())
        .execute(&mut *self.tx)
        .await;

        match bumped {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT guide_earnings")
                    .execute(&mut *self.tx)
                    .await
                    .map_err(store_error)?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    guide_id = %guide_id,
                    booking_id = %booking_id,
                    error = %e,
                    "Guide earnings counters unavailable"
                );
                sqlx::query("ROLLBACK TO SAVEPOINT guide_earnings")
                    .execute(&mut *self.tx)
                    .await
                    .map_err(store_error)?;
                Ok(false)
            }
        }
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(store_error)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(store_error)
    }
}
