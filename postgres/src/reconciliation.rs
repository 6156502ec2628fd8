//! Read-only audit queries and the finding/checkpoint tables.

use crate::error::{narrow, store_error};
use crate::rows::{self, col, money};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guidepay_core::booking::{BookingPaymentStatus, BookingStatus};
use guidepay_core::error::StoreError;
use guidepay_core::reconciliation::{
    AnomalyType, BookingAuditRow, BookingAuditView, DuplicateIntent, PaymentAuditRow,
    ReconciliationFinding, ReconciliationPhase, RunCheckpoint, Severity,
};
use guidepay_core::store::ReconciliationStore;
use guidepay_core::types::{BookingId, PaymentId, RunId};
use sqlx::PgPool;
use sqlx::postgres::PgRow;

/// `PostgreSQL`-backed reconciliation store.
///
/// Scans are keyset-paginated on the primary key so that a resumed run picks
/// up exactly where its checkpoint left off.
#[derive(Debug, Clone)]
pub struct PgReconciliationStore {
    pool: PgPool,
}

impl PgReconciliationStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn audit_view(row: &PgRow) -> Result<Option<BookingAuditView>, StoreError> {
    let Some(id) = col::<Option<i64>>(row, "audit_booking_id")? else {
        return Ok(None);
    };
    Ok(Some(BookingAuditView {
        id: BookingId::new(id),
        status: BookingStatus::parse(&col::<String>(row, "audit_status")?)?,
        payment_status: BookingPaymentStatus::parse(&col::<String>(row, "audit_payment_status")?)?,
        total: money(row, "audit_total")?,
        payment_intent_id: col(row, "audit_intent_id")?,
    }))
}

fn finding(row: &PgRow) -> Result<ReconciliationFinding, StoreError> {
    Ok(ReconciliationFinding {
        run_id: RunId::from_uuid(col(row, "run_id")?),
        booking_id: col::<Option<i64>>(row, "booking_id")?.map(BookingId::new),
        payment_id: col::<Option<i64>>(row, "payment_id")?.map(PaymentId::new),
        anomaly: AnomalyType::parse(&col::<String>(row, "anomaly")?)?,
        severity: Severity::parse(&col::<String>(row, "severity")?)?,
        entity_key: col(row, "entity_key")?,
        details: col(row, "details")?,
        detected_at: col(row, "detected_at")?,
    })
}

fn checkpoint(row: &PgRow) -> Result<RunCheckpoint, StoreError> {
    Ok(RunCheckpoint {
        run_id: RunId::from_uuid(col(row, "run_id")?),
        phase: ReconciliationPhase::parse(&col::<String>(row, "phase")?)?,
        cursor: col(row, "cursor")?,
        since: col(row, "since")?,
        scanned: narrow(col::<i64>(row, "scanned")?, "scanned")?,
        findings: narrow(col::<i64>(row, "findings")?, "findings")?,
        provider_checks: narrow(col::<i32>(row, "provider_checks")?, "provider_checks")?,
        started_at: col(row, "started_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

#[async_trait]
impl ReconciliationStore for PgReconciliationStore {
    async fn scan_payments(
        &self,
        since: DateTime<Utc>,
        after: Option<PaymentId>,
        limit: u32,
    ) -> Result<Vec<PaymentAuditRow>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                p.id, p.booking_id, p.intent_id, p.amount, p.currency, p.status,
                p.provider_payload, p.created_at, p.updated_at,
                b.id AS audit_booking_id,
                b.status AS audit_status,
                b.payment_status AS audit_payment_status,
                b.total_amount AS audit_total,
                b.payment_intent_id AS audit_intent_id
            FROM payments p
            LEFT JOIN bookings b ON b.id = p.booking_id
            WHERE p.created_at >= $1 AND ($2::BIGINT IS NULL OR p.id > $2)
            ORDER BY p.id
            LIMIT $3
            ",
        )
        .bind(since)
        .bind(after.map(|id| id.get()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter()
            .map(|row| {
                Ok(PaymentAuditRow {
                    payment: rows::payment(row)?,
                    booking: audit_view(row)?,
                })
            })
            .collect()
    }

    async fn scan_bookings(
        &self,
        since: DateTime<Utc>,
        after: Option<BookingId>,
        limit: u32,
    ) -> Result<Vec<BookingAuditRow>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                b.id AS audit_booking_id,
                b.status AS audit_status,
                b.payment_status AS audit_payment_status,
                b.total_amount AS audit_total,
                b.payment_intent_id AS audit_intent_id,
                b.payment_intent_id IS NOT NULL AND EXISTS (
                    SELECT 1 FROM payments p WHERE p.intent_id = b.payment_intent_id
                ) AS has_payment_for_intent,
                EXISTS (
                    SELECT 1 FROM payments p WHERE p.booking_id = b.id AND p.status = 'succeeded'
                ) AS has_succeeded_payment
            FROM bookings b
            WHERE b.created_at >= $1
              AND ($2::BIGINT IS NULL OR b.id > $2)
              AND (b.payment_intent_id IS NOT NULL OR b.payment_status = 'paid')
            ORDER BY b.id
            LIMIT $3
            ",
        )
        .bind(since)
        .bind(after.map(|id| id.get()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter()
            .map(|row| {
                let booking = audit_view(row)?.ok_or_else(|| {
                    StoreError::Decode("booking scan returned a row without id".to_string())
                })?;
                Ok(BookingAuditRow {
                    booking,
                    has_payment_for_intent: col(row, "has_payment_for_intent")?,
                    has_succeeded_payment: col(row, "has_succeeded_payment")?,
                })
            })
            .collect()
    }

    async fn find_duplicate_intents(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<DuplicateIntent>, StoreError> {
        let groups: Vec<(String, Vec<i64>)> = sqlx::query_as(
            r"
            SELECT intent_id, array_agg(id ORDER BY id) AS payment_ids
            FROM payments
            WHERE created_at >= $1
            GROUP BY intent_id
            HAVING COUNT(*) > 1
            ORDER BY intent_id
            ",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(groups
            .into_iter()
            .map(|(intent_id, ids)| DuplicateIntent {
                intent_id,
                payment_ids: ids.into_iter().map(PaymentId::new).collect(),
            })
            .collect())
    }

    async fn upsert_finding(&self, finding: &ReconciliationFinding) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO payment_reconciliation_reports (
                run_id, booking_id, payment_id, anomaly, severity, entity_key, details, detected_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id, anomaly, entity_key) DO UPDATE
            SET booking_id = EXCLUDED.booking_id,
                payment_id = EXCLUDED.payment_id,
                severity = EXCLUDED.severity,
                details = EXCLUDED.details,
                detected_at = EXCLUDED.detected_at
            ",
        )
        .bind(finding.run_id.as_uuid())
        .bind(finding.booking_id.map(|id| id.get()))
        .bind(finding.payment_id.map(|id| id.get()))
        .bind(finding.anomaly.as_str())
        .bind(finding.severity.as_str())
        .bind(&finding.entity_key)
        .bind(&finding.details)
        .bind(finding.detected_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: RunId) -> Result<Option<RunCheckpoint>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT run_id, phase, cursor, since, scanned, findings, provider_checks, started_at, updated_at
            FROM reconciliation_runs
            WHERE run_id = $1
            ",
        )
        .bind(run_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        row.as_ref().map(checkpoint).transpose()
    }

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<(), StoreError> {
        let scanned: i64 = narrow(checkpoint.scanned, "scanned")?;
        let findings: i64 = narrow(checkpoint.findings, "findings")?;
        let provider_checks: i32 = narrow(checkpoint.provider_checks, "provider_checks")?;
        let status = if checkpoint.is_complete() { "completed" } else { "running" };

        sqlx::query(
            r"
            INSERT INTO reconciliation_runs (
                run_id, phase, cursor, since, scanned, findings, provider_checks, status, started_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (run_id) DO UPDATE
            SET phase = EXCLUDED.phase,
                cursor = EXCLUDED.cursor,
                scanned = EXCLUDED.scanned,
                findings = EXCLUDED.findings,
                provider_checks = EXCLUDED.provider_checks,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(checkpoint.run_id.as_uuid())
        .bind(checkpoint.phase.as_str())
        .bind(checkpoint.cursor)
        .bind(checkpoint.since)
        .bind(scanned)
        .bind(findings)
        .bind(provider_checks)
        .bind(status)
        .bind(checkpoint.started_at)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn findings_for_run(
        &self,
        run_id: RunId,
    ) -> Result<Vec<ReconciliationFinding>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT run_id, booking_id, payment_id, anomaly, severity, entity_key, details, detected_at
            FROM payment_reconciliation_reports
            WHERE run_id = $1
            ORDER BY detected_at, id
            ",
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter().map(finding).collect()
    }
}
