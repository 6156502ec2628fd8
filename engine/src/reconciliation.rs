//! Reconciliation engine.
//!
//! Periodic, report-only audit of the ledger. A run walks three phases:
//!
//! 1. **Payments**: payments joined to bookings in ascending-id batches
//!    (orphans, amount and status mismatches, plus a bounded number of
//!    cross-checks against the provider)
//! 2. **Bookings**: bookings with an intent reference or marked paid
//!    (missing payment records, paid without a succeeded payment)
//! 3. **Duplicates**: intent ids shared by several payment rows
//!
//! A checkpoint is saved after every batch. Re-running the same run id resumes
//! from it, and findings are upserted on `(run, anomaly, entity)`, so partial
//! re-execution never duplicates them. Nothing is ever corrected.

use crate::config::ReconciliationConfig;
use crate::intent::with_timeout;
use chrono::{DateTime, Utc};
use guidepay_core::alert::{Alert, AlertSink};
use guidepay_core::booking::{BookingPaymentStatus, BookingStatus};
use guidepay_core::environment::Clock;
use guidepay_core::error::{ErrorKind, StoreError};
use guidepay_core::payment::{Payment, PaymentStatus};
use guidepay_core::provider::PaymentProvider;
use guidepay_core::reconciliation::{
    AnomalyType, BookingAuditRow, DuplicateIntent, PaymentAuditRow, ReconciliationFinding,
    ReconciliationPhase, RunCheckpoint, Severity,
};
use guidepay_core::store::ReconciliationStore;
use guidepay_core::types::{BookingId, PaymentId, RunId};
use guidepay_runtime::metrics::ReconciliationMetrics;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Parameters of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationParams {
    /// Run id; reusing one resumes that run
    pub run_id: RunId,
    /// How far back to look, from the run start
    pub lookback: chrono::Duration,
    /// Rows per batch
    pub batch_size: u32,
}

impl ReconciliationParams {
    /// Parameters for a fresh run.
    #[must_use]
    pub fn new(lookback: chrono::Duration, batch_size: u32) -> Self {
        Self {
            run_id: RunId::new(),
            lookback,
            batch_size: batch_size.max(1),
        }
    }
}

/// Summary of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Run id
    pub run_id: RunId,
    /// Continued from a stored checkpoint
    pub resumed: bool,
    /// Rows examined across phases
    pub scanned: u64,
    /// Distinct findings of the run
    pub findings_total: u64,
    /// Distinct findings per severity
    pub by_severity: BTreeMap<Severity, u64>,
    /// Provider cross-checks performed
    pub provider_checks: u32,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
}

/// Reconciliation failures.
#[derive(Error, Debug)]
pub enum ReconciliationError {
    /// Audit query or checkpoint write failed; the run can be resumed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconciliationError {
    /// Classification for propagation.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(err) => err.kind(),
        }
    }
}

fn payment_key(id: PaymentId) -> String {
    format!("payment:{id}")
}

fn booking_key(id: BookingId) -> String {
    format!("booking:{id}")
}

fn intent_key(intent_id: &str) -> String {
    format!("intent:{intent_id}")
}

/// Findings for one payment joined to its booking.
#[must_use]
pub fn classify_payment(
    row: &PaymentAuditRow,
    run_id: RunId,
    epsilon: u64,
    now: DateTime<Utc>,
) -> Vec<ReconciliationFinding> {
    let payment = &row.payment;
    let key = payment_key(payment.id);

    let Some(booking) = &row.booking else {
        return vec![
            ReconciliationFinding::new(run_id, AnomalyType::OrphanPayment, key, now)
                .with_payment(payment.id)
                .with_details(json!({
                    "intent_id": payment.intent_id,
                    "booking_id": payment.booking_id,
                    "amount": payment.amount,
                })),
        ];
    };

    let mut findings = Vec::new();

    if payment.amount.abs_diff(booking.total) > epsilon {
        findings.push(
            ReconciliationFinding::new(run_id, AnomalyType::AmountMismatch, key.clone(), now)
                .with_payment(payment.id)
                .with_booking(booking.id)
                .with_details(json!({
                    "payment_amount": payment.amount,
                    "booking_total": booking.total,
                    "difference": payment.amount.abs_diff(booking.total),
                })),
        );
    }

    let booking_settled = matches!(
        booking.status,
        BookingStatus::Confirmed | BookingStatus::Completed
    ) && booking.payment_status == BookingPaymentStatus::Paid;
    let references_payment = booking.payment_intent_id.as_deref() == Some(payment.intent_id.as_str());

    let status_drift = if payment.status == PaymentStatus::Succeeded {
        !booking_settled
    } else {
        references_payment && booking.payment_status == BookingPaymentStatus::Paid
    };
    if status_drift {
        findings.push(
            ReconciliationFinding::new(run_id, AnomalyType::StatusMismatch, key, now)
                .with_payment(payment.id)
                .with_booking(booking.id)
                .with_details(json!({
                    "payment_status": payment.status,
                    "booking_status": booking.status,
                    "booking_payment_status": booking.payment_status,
                })),
        );
    }

    findings
}

/// Findings for one booking with its payment facts.
#[must_use]
pub fn classify_booking(
    row: &BookingAuditRow,
    run_id: RunId,
    now: DateTime<Utc>,
) -> Vec<ReconciliationFinding> {
    let booking = &row.booking;
    let mut findings = Vec::new();

    if let Some(intent_id) = &booking.payment_intent_id {
        if !row.has_payment_for_intent {
            findings.push(
                ReconciliationFinding::new(
                    run_id,
                    AnomalyType::MissingPaymentRecord,
                    booking_key(booking.id),
                    now,
                )
                .with_booking(booking.id)
                .with_details(json!({ "intent_id": intent_id })),
            );
        }
    }

    if booking.payment_status == BookingPaymentStatus::Paid && !row.has_succeeded_payment {
        findings.push(
            ReconciliationFinding::new(
                run_id,
                AnomalyType::PaidWithoutSuccess,
                booking_key(booking.id),
                now,
            )
            .with_booking(booking.id)
            .with_details(json!({
                "status": booking.status,
                "intent_id": booking.payment_intent_id,
            })),
        );
    }

    findings
}

/// Finding for an intent id shared by several payments.
#[must_use]
pub fn classify_duplicate(
    duplicate: &DuplicateIntent,
    run_id: RunId,
    now: DateTime<Utc>,
) -> ReconciliationFinding {
    let finding = ReconciliationFinding::new(
        run_id,
        AnomalyType::DuplicateIntent,
        intent_key(&duplicate.intent_id),
        now,
    )
    .with_details(json!({
        "intent_id": duplicate.intent_id,
        "payment_ids": duplicate.payment_ids,
    }));
    match duplicate.payment_ids.first() {
        Some(first) => finding.with_payment(*first),
        None => finding,
    }
}

/// Audits bookings and payments against each other and the provider.
pub struct ReconciliationEngine {
    store: Arc<dyn ReconciliationStore>,
    provider: Arc<dyn PaymentProvider>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: ReconciliationConfig,
}

impl ReconciliationEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn ReconciliationStore>,
        provider: Arc<dyn PaymentProvider>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            provider,
            alerts,
            clock,
            config,
        }
    }

    /// Run (or resume) a reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`ReconciliationError::Store`] if an audit query or checkpoint
    /// write fails. Progress up to the last saved batch is kept; calling `run`
    /// again with the same run id resumes from there.
    pub async fn run(
        &self,
        params: &ReconciliationParams,
    ) -> Result<ReconciliationReport, ReconciliationError> {
        let started = Instant::now();
        let now = self.clock.now();
        let batch_size = params.batch_size.max(1);

        let (mut checkpoint, resumed) = match self.store.load_checkpoint(params.run_id).await? {
            Some(checkpoint) => (checkpoint, true),
            None => {
                let checkpoint =
                    RunCheckpoint::start(params.run_id, now - params.lookback, now);
                self.store.save_checkpoint(&checkpoint).await?;
                (checkpoint, false)
            }
        };

        tracing::info!(
            run_id = %params.run_id,
            resumed,
            phase = %checkpoint.phase,
            since = %checkpoint.since,
            "Reconciliation run started"
        );

        while !checkpoint.is_complete() {
            match checkpoint.phase {
                ReconciliationPhase::Payments => {
                    self.payments_batch(&mut checkpoint, batch_size).await?;
                }
                ReconciliationPhase::Bookings => {
                    self.bookings_batch(&mut checkpoint, batch_size).await?;
                }
                ReconciliationPhase::Duplicates => {
                    let duplicates = self.store.find_duplicate_intents(checkpoint.since).await?;
                    for duplicate in &duplicates {
                        self.record(&mut checkpoint, classify_duplicate(duplicate, params.run_id, self.clock.now()))
                            .await?;
                    }
                    checkpoint.advance(ReconciliationPhase::Completed);
                }
                ReconciliationPhase::Completed => {}
            }
            checkpoint.updated_at = self.clock.now();
            self.store.save_checkpoint(&checkpoint).await?;
        }

        let findings = self.store.findings_for_run(params.run_id).await?;
        let mut by_severity = BTreeMap::new();
        for finding in &findings {
            *by_severity.entry(finding.severity).or_insert(0) += 1;
        }

        ReconciliationMetrics::record_run(started.elapsed());
        let report = ReconciliationReport {
            run_id: params.run_id,
            resumed,
            scanned: checkpoint.scanned,
            findings_total: findings.len() as u64,
            by_severity,
            provider_checks: checkpoint.provider_checks,
            started_at: checkpoint.started_at,
            finished_at: self.clock.now(),
        };
        tracing::info!(
            run_id = %report.run_id,
            scanned = report.scanned,
            findings = report.findings_total,
            provider_checks = report.provider_checks,
            "Reconciliation run completed"
        );
        Ok(report)
    }

    async fn payments_batch(
        &self,
        checkpoint: &mut RunCheckpoint,
        batch_size: u32,
    ) -> Result<(), ReconciliationError> {
        let rows = self
            .store
            .scan_payments(checkpoint.since, checkpoint.cursor.map(PaymentId::new), batch_size)
            .await?;

        for row in &rows {
            let now = self.clock.now();
            let mut findings =
                classify_payment(row, checkpoint.run_id, self.config.amount_epsilon, now);
            if row.booking.is_some() && checkpoint.provider_checks < self.config.provider_check_limit {
                checkpoint.provider_checks += 1;
                findings.extend(self.cross_check(&row.payment, checkpoint.run_id, now).await);
            }
            for finding in findings {
                self.record(checkpoint, finding).await?;
            }
            checkpoint.scanned += 1;
            checkpoint.cursor = Some(row.payment.id.get());
        }

        if rows.len() < batch_size as usize {
            checkpoint.advance(ReconciliationPhase::Bookings);
        }
        Ok(())
    }

    async fn bookings_batch(
        &self,
        checkpoint: &mut RunCheckpoint,
        batch_size: u32,
    ) -> Result<(), ReconciliationError> {
        let rows = self
            .store
            .scan_bookings(checkpoint.since, checkpoint.cursor.map(BookingId::new), batch_size)
            .await?;

        for row in &rows {
            for finding in classify_booking(row, checkpoint.run_id, self.clock.now()) {
                self.record(checkpoint, finding).await?;
            }
            checkpoint.scanned += 1;
            checkpoint.cursor = Some(row.booking.id.get());
        }

        if rows.len() < batch_size as usize {
            checkpoint.advance(ReconciliationPhase::Duplicates);
        }
        Ok(())
    }

    /// Compare a payment with the provider's view; errors skip the check.
    async fn cross_check(
        &self,
        payment: &Payment,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> Vec<ReconciliationFinding> {
        let intent = match with_timeout(
            self.config.provider_timeout,
            self.provider.retrieve_intent(&payment.intent_id),
        )
        .await
        {
            Ok(intent) => intent,
            Err(error) => {
                tracing::warn!(
                    payment_id = %payment.id,
                    intent_id = %payment.intent_id,
                    error = %error,
                    "Provider cross-check skipped"
                );
                return Vec::new();
            }
        };

        let mut findings = Vec::new();
        if !intent.status.agrees_with(payment.status) {
            findings.push(
                ReconciliationFinding::new(
                    run_id,
                    AnomalyType::ProviderStatusMismatch,
                    intent_key(&payment.intent_id),
                    now,
                )
                .with_payment(payment.id)
                .with_booking(payment.booking_id)
                .with_details(json!({
                    "payment_status": payment.status,
                    "provider_status": intent.status,
                })),
            );
        }
        if intent.amount.abs_diff(payment.amount) > self.config.amount_epsilon {
            findings.push(
                ReconciliationFinding::new(
                    run_id,
                    AnomalyType::ProviderAmountMismatch,
                    intent_key(&payment.intent_id),
                    now,
                )
                .with_payment(payment.id)
                .with_booking(payment.booking_id)
                .with_details(json!({
                    "payment_amount": payment.amount,
                    "provider_amount": intent.amount,
                })),
            );
        }
        findings
    }

    async fn record(
        &self,
        checkpoint: &mut RunCheckpoint,
        finding: ReconciliationFinding,
    ) -> Result<(), ReconciliationError> {
        self.store.upsert_finding(&finding).await?;
        checkpoint.findings += 1;
        ReconciliationMetrics::record_finding(finding.anomaly, finding.severity);

        tracing::warn!(
            run_id = %finding.run_id,
            anomaly = %finding.anomaly,
            severity = %finding.severity,
            entity = %finding.entity_key,
            "Reconciliation finding"
        );

        if finding.severity >= Severity::High {
            self.alerts.notify(Alert::new(
                format!("reconciliation.{}", finding.anomaly),
                finding.severity,
                format!("Reconciliation found {} on {}", finding.anomaly, finding.entity_key),
                json!({
                    "run_id": finding.run_id,
                    "entity": finding.entity_key,
                    "details": finding.details,
                }),
            ));
        }
        Ok(())
    }
}
