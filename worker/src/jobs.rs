//! Side-effect job handlers and the consumer loop.
//!
//! Each queue has one [`JobHandler`]. A consumer claims a batch, runs the
//! handler on every job with bounded concurrency and reports the result back
//! to the [`JobSource`], which retries or dead-letters failed jobs. Handlers
//! must be idempotent: delivery is at-least-once.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use guidepay_core::BoxFuture;
use guidepay_core::alert::{Alert, AlertSink};
use guidepay_core::environment::Clock;
use guidepay_core::error::StoreError;
use guidepay_core::queue::{ClaimedJob, JobSource, QueueError, QueueName};
use guidepay_core::reconciliation::{
    BookingAuditView, PaymentAuditRow, ReconciliationFinding, Severity,
};
use guidepay_core::store::{LedgerStore, ReconciliationStore};
use guidepay_core::types::{BookingId, GuideId, Money, PaymentId, RunId};
use guidepay_engine::reconciliation::classify_payment;
use guidepay_postgres::PgLedgerStore;
use guidepay_runtime::metrics::{JobMetrics, ReconciliationMetrics};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// High half of the run ids given to spot checks (`"spotchck"` in ASCII).
const SPOT_CHECK_RUN_PREFIX: u64 = 0x7370_6f74_6368_636b;

/// Failure of one job attempt.
#[derive(Error, Debug)]
pub enum JobError {
    /// Payload is missing a field or has the wrong shape
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Processes the jobs of one queue.
pub trait JobHandler: Send + Sync {
    /// Run one job.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] if the attempt failed; the job is retried.
    fn handle<'a>(&'a self, job: &'a ClaimedJob) -> BoxFuture<'a, Result<(), JobError>>;
}

fn field<T: DeserializeOwned>(job: &ClaimedJob, name: &str) -> Result<T, JobError> {
    let value = job
        .payload
        .get(name)
        .cloned()
        .ok_or_else(|| JobError::InvalidPayload(format!("{}: missing `{name}`", job.key)))?;
    serde_json::from_value(value)
        .map_err(|e| JobError::InvalidPayload(format!("{}: `{name}`: {e}", job.key)))
}

/// Recomputes a guide's performance counters (`guide_stats`).
#[derive(Debug, Clone)]
pub struct GuideStatsHandler {
    ledger: PgLedgerStore,
}

impl GuideStatsHandler {
    /// Create a handler over the ledger.
    #[must_use]
    pub const fn new(ledger: PgLedgerStore) -> Self {
        Self { ledger }
    }
}

impl JobHandler for GuideStatsHandler {
    fn handle<'a>(&'a self, job: &'a ClaimedJob) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            let guide_id: GuideId = field(job, "guide_id")?;
            self.ledger.refresh_guide_stats(guide_id).await?;
            Ok(())
        })
    }
}

/// Emits payment analytics events (`analytics`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyticsHandler;

impl JobHandler for AnalyticsHandler {
    fn handle<'a>(&'a self, job: &'a ClaimedJob) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            let event: String = field(job, "event")?;
            let booking_id: BookingId = field(job, "booking_id")?;
            let amount: Money = field(job, "amount")?;

            metrics::counter!("guidepay.analytics.events", "event" => event.clone()).increment(1);
            if event == "payment_succeeded" {
                metrics::counter!("guidepay.analytics.revenue_minor")
                    .increment(amount.minor().unsigned_abs());
            }
            tracing::info!(event = %event, booking_id = %booking_id, amount = amount.minor(), "Analytics event");
            Ok(())
        })
    }
}

/// Hands customer notifications to the delivery channel (`notifications`).
///
/// Delivery itself belongs to the messaging service; this consumer records the
/// request as a structured event that the log shipper forwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationHandler;

impl JobHandler for NotificationHandler {
    fn handle<'a>(&'a self, job: &'a ClaimedJob) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            let template: String = field(job, "template")?;
            let booking_id: BookingId = field(job, "booking_id")?;

            metrics::counter!("guidepay.notifications.requested", "template" => template.clone())
                .increment(1);
            tracing::info!(template = %template, booking_id = %booking_id, job_key = %job.key, "Notification requested");
            Ok(())
        })
    }
}

/// Audits one payment right after its transition (`reconciliation`).
///
/// Applies the payment classification of the periodic run to a single row.
/// Findings are stored under a run id derived from the job id, so a retried
/// job overwrites its own findings instead of adding new ones.
pub struct PaymentAuditHandler<S: LedgerStore> {
    ledger: S,
    findings: Arc<dyn ReconciliationStore>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    amount_epsilon: u64,
}

impl<S: LedgerStore> PaymentAuditHandler<S> {
    /// Create a handler.
    #[must_use]
    pub fn new(
        ledger: S,
        findings: Arc<dyn ReconciliationStore>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        amount_epsilon: u64,
    ) -> Self {
        Self {
            ledger,
            findings,
            alerts,
            clock,
            amount_epsilon,
        }
    }

    /// Run id under which the findings of `job_id` are stored.
    #[must_use]
    pub fn run_id(job_id: i64) -> RunId {
        RunId::from_uuid(Uuid::from_u64_pair(SPOT_CHECK_RUN_PREFIX, job_id.unsigned_abs()))
    }

    async fn audit(
        &self,
        job_id: i64,
        booking_id: BookingId,
        payment_id: PaymentId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationFinding>, JobError> {
        let Some(payment) = self
            .ledger
            .payments_for_booking(booking_id)
            .await?
            .into_iter()
            .find(|p| p.id == payment_id)
        else {
            tracing::warn!(booking_id = %booking_id, payment_id = %payment_id, "Audited payment not found");
            return Ok(Vec::new());
        };
        let booking = self.ledger.find_booking(booking_id).await?;
        let row = PaymentAuditRow {
            payment,
            booking: booking.as_ref().map(BookingAuditView::from),
        };
        Ok(classify_payment(&row, Self::run_id(job_id), self.amount_epsilon, now))
    }
}

impl<S: LedgerStore> JobHandler for PaymentAuditHandler<S> {
    fn handle<'a>(&'a self, job: &'a ClaimedJob) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            let booking_id: BookingId = field(job, "booking_id")?;
            let payment_id: PaymentId = field(job, "payment_id")?;

            let findings = self.audit(job.id, booking_id, payment_id, self.clock.now()).await?;
            for finding in &findings {
                self.findings.upsert_finding(finding).await?;
                ReconciliationMetrics::record_finding(finding.anomaly, finding.severity);
                tracing::warn!(
                    job_key = %job.key,
                    anomaly = %finding.anomaly,
                    severity = %finding.severity,
                    entity = %finding.entity_key,
                    "Payment spot check finding"
                );
                if finding.severity >= Severity::High {
                    self.alerts.notify(Alert::new(
                        format!("reconciliation.{}", finding.anomaly),
                        finding.severity,
                        format!("Spot check found {} on {}", finding.anomaly, finding.entity_key),
                        json!({
                            "job_key": job.key,
                            "entity": finding.entity_key,
                            "details": finding.details,
                        }),
                    ));
                }
            }
            tracing::debug!(job_key = %job.key, findings = findings.len(), "Payment spot check done");
            Ok(())
        })
    }
}

/// Consumer loop settings.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    /// Jobs claimed per poll
    pub batch_size: u32,
    /// Jobs processed at once
    pub concurrency: usize,
    /// Wait after an empty poll or a broker error
    pub poll_interval: Duration,
    /// Attempts before the broker dead-letters a job
    pub max_attempts: u32,
}

/// Run one job and report the outcome to `source`.
///
/// # Errors
///
/// Returns [`QueueError`] if the outcome cannot be reported; the job stays
/// `running` and is not redelivered by this process.
pub async fn process_job(
    source: &dyn JobSource,
    handler: &dyn JobHandler,
    job: &ClaimedJob,
    max_attempts: u32,
) -> Result<(), QueueError> {
    match handler.handle(job).await {
        Ok(()) => {
            source.complete(job.id).await?;
            JobMetrics::record_completed(job.queue);
            tracing::debug!(queue = %job.queue, job_key = %job.key, attempt = job.attempt, "Job completed");
        }
        Err(error) => {
            let message = error.to_string();
            source.fail(job.id, &message).await?;
            if job.attempt >= max_attempts {
                JobMetrics::record_dead(job.queue);
                tracing::error!(queue = %job.queue, job_key = %job.key, attempt = job.attempt, error = %message, "Job exhausted its attempts");
            } else {
                tracing::warn!(queue = %job.queue, job_key = %job.key, attempt = job.attempt, error = %message, "Job failed");
            }
        }
    }
    Ok(())
}

/// Claim and process jobs from `queue` until `shutdown` turns `true`.
///
/// The batch in flight when shutdown is signalled is finished before returning.
pub async fn run_consumer(
    queue: QueueName,
    source: Arc<dyn JobSource>,
    handler: Arc<dyn JobHandler>,
    settings: ConsumerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(queue = %queue, concurrency = settings.concurrency, "Job consumer started");
    let concurrency = settings.concurrency.max(1);

    while !*shutdown.borrow() {
        let claimed = match source.claim(queue, settings.batch_size.max(1)).await {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::warn!(queue = %queue, error = %error, "Failed to claim jobs");
                Vec::new()
            }
        };

        if claimed.is_empty() {
            tokio::select! {
                () = tokio::time::sleep(settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        futures::stream::iter(claimed)
            .for_each_concurrent(concurrency, |job| {
                let source = source.as_ref();
                let handler = handler.as_ref();
                async move {
                    if let Err(error) = process_job(source, handler, &job, settings.max_attempts).await {
                        tracing::error!(queue = %job.queue, job_key = %job.key, error = %error, "Failed to report job outcome");
                    }
                }
            })
            .await;
    }

    tracing::info!(queue = %queue, "Job consumer stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use guidepay_core::queue::{JobQueue, JobRequest, JobStatus};
    use guidepay_core::reconciliation::AnomalyType;
    use guidepay_testing::{
        InMemoryJobQueue, InMemoryLedger, RecordingAlertSink, fixtures, test_clock,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(max_attempts: u32) -> ConsumerSettings {
        ConsumerSettings {
            batch_size: 10,
            concurrency: 2,
            poll_interval: Duration::from_millis(5),
            max_attempts,
        }
    }

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl JobHandler for Flaky {
        fn handle<'a>(&'a self, _job: &'a ClaimedJob) -> BoxFuture<'a, Result<(), JobError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(JobError::Store(StoreError::Transient("busy".to_string())));
                }
                Ok(())
            })
        }
    }

    fn analytics_job(payment_id: i64) -> JobRequest {
        JobRequest::new(
            QueueName::Analytics,
            format!("analytics:payment-succeeded:{payment_id}"),
            json!({
                "event": "payment_succeeded",
                "booking_id": 1,
                "payment_id": payment_id,
                "amount": 2000,
            }),
        )
    }

    async fn claim_one(queue: &InMemoryJobQueue, name: QueueName) -> ClaimedJob {
        queue.claim(name, 1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn successful_job_is_completed() {
        let queue = InMemoryJobQueue::new(3);
        queue.enqueue(analytics_job(7)).await.unwrap();
        let job = claim_one(&queue, QueueName::Analytics).await;

        process_job(&queue, &AnalyticsHandler, &job, 3).await.unwrap();

        assert_eq!(queue.jobs()[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_attempt() {
        let queue = InMemoryJobQueue::new(1);
        queue
            .enqueue(JobRequest::new(QueueName::Notifications, "notifications:x", json!({})))
            .await
            .unwrap();
        let job = claim_one(&queue, QueueName::Notifications).await;

        process_job(&queue, &NotificationHandler, &job, 1).await.unwrap();

        let stored = &queue.jobs()[0];
        assert_eq!(stored.status, JobStatus::Dead);
        assert!(stored.last_error.as_deref().unwrap().contains("template"));
    }

    #[tokio::test]
    async fn consumer_retries_until_success_and_stops_on_shutdown() {
        let queue = Arc::new(InMemoryJobQueue::new(5));
        queue.enqueue(analytics_job(1)).await.unwrap();
        let handler = Arc::new(Flaky::new(2));
        let (tx, rx) = watch::channel(false);

        let consumer = tokio::spawn(run_consumer(
            QueueName::Analytics,
            queue.clone(),
            handler.clone(),
            settings(5),
            rx,
        ));

        let done = guidepay_testing::eventually(Duration::from_secs(2), || {
            queue.jobs()[0].status == JobStatus::Completed
        })
        .await;
        tx.send(true).unwrap();
        consumer.await.unwrap();

        assert!(done);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.jobs()[0].attempts, 3);
    }

    #[tokio::test]
    async fn consumer_dead_letters_after_max_attempts() {
        let queue = Arc::new(InMemoryJobQueue::new(2));
        queue.enqueue(analytics_job(1)).await.unwrap();
        let handler = Arc::new(Flaky::new(10));
        let (tx, rx) = watch::channel(false);

        let consumer = tokio::spawn(run_consumer(
            QueueName::Analytics,
            queue.clone(),
            handler.clone(),
            settings(2),
            rx,
        ));

        let dead = guidepay_testing::eventually(Duration::from_secs(2), || {
            queue.jobs()[0].status == JobStatus::Dead
        })
        .await;
        tx.send(true).unwrap();
        consumer.await.unwrap();

        assert!(dead);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    fn audit_handler(
        ledger: &InMemoryLedger,
        alerts: &Arc<RecordingAlertSink>,
    ) -> PaymentAuditHandler<InMemoryLedger> {
        PaymentAuditHandler::new(
            ledger.clone(),
            Arc::new(ledger.clone()),
            alerts.clone(),
            Arc::new(test_clock()),
            1,
        )
    }

    fn audit_job(id: i64, booking_id: i64, payment_id: i64) -> ClaimedJob {
        ClaimedJob {
            id,
            queue: QueueName::Reconciliation,
            key: format!("reconciliation:payment:{payment_id}"),
            payload: json!({ "payment_id": payment_id, "booking_id": booking_id }),
            attempt: 1,
            enqueued_at: fixtures::epoch(),
        }
    }

    #[tokio::test]
    async fn spot_check_of_consistent_payment_records_nothing() {
        let ledger = InMemoryLedger::new();
        ledger.seed_booking(fixtures::paid_booking_row(1, 2000, "pi_1")).await;
        ledger.seed_payment(fixtures::payment_row(1, 1, "pi_1", 2000)).await;
        let alerts = Arc::new(RecordingAlertSink::new());

        audit_handler(&ledger, &alerts)
            .handle(&audit_job(10, 1, 1))
            .await
            .unwrap();

        assert!(ledger.findings().await.is_empty());
        assert!(alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn spot_check_flags_amount_mismatch_and_alerts() {
        let ledger = InMemoryLedger::new();
        ledger.seed_booking(fixtures::paid_booking_row(1, 2000, "pi_1")).await;
        ledger.seed_payment(fixtures::payment_row(1, 1, "pi_1", 1500)).await;
        let alerts = Arc::new(RecordingAlertSink::new());
        let handler = audit_handler(&ledger, &alerts);

        handler.handle(&audit_job(10, 1, 1)).await.unwrap();
        handler.handle(&audit_job(10, 1, 1)).await.unwrap();

        let findings = ledger.findings().await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].anomaly, AnomalyType::AmountMismatch);
        assert_eq!(findings[0].run_id, PaymentAuditHandler::<InMemoryLedger>::run_id(10));
        assert!(!alerts.with_key("reconciliation.amount_mismatch").is_empty());
    }

    #[tokio::test]
    async fn spot_check_of_unknown_payment_is_a_no_op() {
        let ledger = InMemoryLedger::new();
        let alerts = Arc::new(RecordingAlertSink::new());

        audit_handler(&ledger, &alerts)
            .handle(&audit_job(10, 1, 99))
            .await
            .unwrap();

        assert!(ledger.findings().await.is_empty());
    }

    #[test]
    fn spot_check_run_ids_are_stable_per_job() {
        type Handler = PaymentAuditHandler<InMemoryLedger>;
        assert_eq!(Handler::run_id(5), Handler::run_id(5));
        assert_ne!(Handler::run_id(5), Handler::run_id(6));
    }
}
