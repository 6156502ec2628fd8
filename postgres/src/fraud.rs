//! Activity reads and the `fraud_events` audit trail.

use crate::error::{narrow, store_error};
use crate::rows::col;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guidepay_core::error::StoreError;
use guidepay_core::fraud::{ActivitySnapshot, FraudEvent};
use guidepay_core::store::FraudStore;
use guidepay_core::types::{Money, UserId};
use sqlx::PgPool;

/// `PostgreSQL`-backed fraud store.
#[derive(Debug, Clone)]
pub struct PgFraudStore {
    pool: PgPool,
}

impl PgFraudStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FraudStore for PgFraudStore {
    async fn activity_snapshot(
        &self,
        user_id: UserId,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ActivitySnapshot, StoreError> {
        let row = sqlx::query(
            r"
            WITH own_payments AS (
                SELECT p.status, p.created_at
                FROM payments p
                JOIN bookings b ON b.id = p.booking_id
                WHERE b.user_id = $1 AND p.created_at > $2 - INTERVAL '24 hours'
            )
            SELECT
                (SELECT COUNT(*) FROM bookings
                  WHERE user_id = $1 AND created_at > $2 - INTERVAL '1 hour') AS bookings_last_hour,
                (SELECT COUNT(*) FROM own_payments) AS payments_last_day,
                (SELECT COUNT(*) FROM own_payments WHERE status = 'failed') AS failed_payments_last_day,
                (SELECT COUNT(*) FROM own_payments
                  WHERE created_at > $2 - INTERVAL '10 minutes') AS payment_attempts_last_10m,
                (SELECT FLOOR(AVG(total_amount))::BIGINT FROM bookings
                  WHERE user_id = $1 AND created_at > $2 - INTERVAL '90 days') AS baseline_amount,
                (SELECT created_at FROM users WHERE id = $1) AS account_created_at,
                (SELECT COUNT(DISTINCT user_id) FROM fraud_events
                  WHERE $3::TEXT IS NOT NULL
                    AND ip_address = $3
                    AND user_id <> $1
                    AND created_at > $2 - INTERVAL '24 hours') AS users_sharing_ip
            ",
        )
        .bind(user_id.as_uuid())
        .bind(now)
        .bind(ip_address)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        let count = |name: &str| -> Result<u32, StoreError> {
            // Saturate instead of failing: a huge count scores the same as u32::MAX.
            Ok(u32::try_from(col::<i64>(&row, name)?).unwrap_or(u32::MAX))
        };

        Ok(ActivitySnapshot {
            bookings_last_hour: count("bookings_last_hour")?,
            payments_last_day: count("payments_last_day")?,
            failed_payments_last_day: count("failed_payments_last_day")?,
            payment_attempts_last_10m: count("payment_attempts_last_10m")?,
            baseline_amount: col::<Option<i64>>(&row, "baseline_amount")?.map(Money::from_minor),
            account_created_at: col(&row, "account_created_at")?,
            users_sharing_ip: count("users_sharing_ip")?,
            captured_at: now,
        })
    }

    async fn record_fraud_event(&self, event: &FraudEvent) -> Result<(), StoreError> {
        let signals = serde_json::to_value(&event.signals)
            .map_err(|e| StoreError::Decode(format!("fraud signals: {e}")))?;
        let score: i16 = narrow(event.score, "score")?;

        sqlx::query(
            r"
            INSERT INTO fraud_events (
                user_id, booking_id, ip_address, score, risk_level, decision, signals, retry_burst, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(event.user_id.as_uuid())
        .bind(event.booking_id.map(|id| id.get()))
        .bind(&event.ip_address)
        .bind(score)
        .bind(event.level.as_str())
        .bind(event.decision.as_str())
        .bind(signals)
        .bind(event.retry_burst)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        metrics::counter!("guidepay.fraud.events_recorded", "level" => event.level.as_str())
            .increment(1);
        Ok(())
    }
}
