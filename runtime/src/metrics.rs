//! Prometheus metrics for the transactional core.
//!
//! Components record through the small recorder types below so metric names
//! stay in one place. The worker installs the exporter with [`MetricsServer`].
//!
//! # Example
//!
//! ```rust,no_run
//! use guidepay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use guidepay_core::fraud::RiskLevel;
use guidepay_core::queue::QueueName;
use guidepay_core::reconciliation::{AnomalyType, Severity};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics server started");
        self.handle = Some(handle);
        Ok(())
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!("guidepay.booking.created", "Bookings created in pending status");
    describe_counter!("guidepay.booking.conflicts", "Booking requests rejected for overlap");
    describe_histogram!(
        "guidepay.booking.create_duration_seconds",
        "Time taken by the booking creation transaction"
    );

    describe_counter!("guidepay.intent.created", "Payment intents created at the provider");
    describe_counter!("guidepay.intent.reused", "Active payment intents reused");
    describe_counter!("guidepay.intent.provider_errors", "Provider failures while creating intents");

    describe_counter!("guidepay.webhook.processed", "Webhook events handled, by outcome");
    describe_counter!("guidepay.webhook.rejected", "Webhook events rejected before processing");

    describe_counter!("guidepay.fraud.scored", "Fraud assessments, by risk level");
    describe_counter!("guidepay.fraud.fail_open", "Assessments that failed open");

    describe_counter!("guidepay.reconciliation.findings", "Reconciliation findings recorded");
    describe_counter!("guidepay.reconciliation.runs", "Reconciliation runs completed");
    describe_histogram!(
        "guidepay.reconciliation.run_duration_seconds",
        "Wall time of a reconciliation run"
    );

    describe_counter!("guidepay.jobs.enqueued", "Jobs stored by the queue");
    describe_counter!("guidepay.jobs.duplicate", "Enqueues collapsed by job key");
    describe_counter!("guidepay.jobs.completed", "Jobs acknowledged by consumers");
    describe_counter!("guidepay.jobs.dead", "Jobs moved to the dead-letter state");

    describe_counter!("guidepay.alerts.sent", "Alerts dispatched, by severity");
    describe_counter!("guidepay.alerts.suppressed", "Alerts dropped by rate limiting");

    describe_counter!("guidepay.retry.attempts", "Retries of transactional units");
    describe_counter!("guidepay.retry.exhausted", "Transactional units that spent every attempt");
}

/// Booking creation metrics recorder.
pub struct BookingMetrics;

impl BookingMetrics {
    /// Record a created booking.
    pub fn record_created(duration: Duration) {
        counter!("guidepay.booking.created").increment(1);
        histogram!("guidepay.booking.create_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rejected overlapping request.
    pub fn record_conflict() {
        counter!("guidepay.booking.conflicts").increment(1);
    }
}

/// Payment intent metrics recorder.
pub struct IntentMetrics;

impl IntentMetrics {
    /// Record a newly created intent.
    pub fn record_created() {
        counter!("guidepay.intent.created").increment(1);
    }

    /// Record a reused intent.
    pub fn record_reused() {
        counter!("guidepay.intent.reused").increment(1);
    }

    /// Record a provider failure.
    pub fn record_provider_error() {
        counter!("guidepay.intent.provider_errors").increment(1);
    }
}

/// Webhook metrics recorder.
pub struct WebhookMetrics;

impl WebhookMetrics {
    /// Record a handled event.
    pub fn record_processed(outcome: &'static str) {
        counter!("guidepay.webhook.processed", "outcome" => outcome).increment(1);
    }

    /// Record a rejected event (bad signature or payload).
    pub fn record_rejected(reason: &'static str) {
        counter!("guidepay.webhook.rejected", "reason" => reason).increment(1);
    }
}

/// Fraud scoring metrics recorder.
pub struct FraudMetrics;

impl FraudMetrics {
    /// Record an assessment.
    pub fn record_scored(level: RiskLevel) {
        counter!("guidepay.fraud.scored", "level" => level.as_str()).increment(1);
    }

    /// Record a fail-open assessment.
    pub fn record_fail_open() {
        counter!("guidepay.fraud.fail_open").increment(1);
    }
}

/// Reconciliation metrics recorder.
pub struct ReconciliationMetrics;

impl ReconciliationMetrics {
    /// Record a finding.
    pub fn record_finding(anomaly: AnomalyType, severity: Severity) {
        counter!(
            "guidepay.reconciliation.findings",
            "anomaly" => anomaly.as_str(),
            "severity" => severity.as_str()
        )
        .increment(1);
    }

    /// Record a completed run.
    pub fn record_run(duration: Duration) {
        counter!("guidepay.reconciliation.runs").increment(1);
        histogram!("guidepay.reconciliation.run_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Job queue metrics recorder.
pub struct JobMetrics;

impl JobMetrics {
    /// Record a stored job.
    pub fn record_enqueued(queue: QueueName) {
        counter!("guidepay.jobs.enqueued", "queue" => queue.as_str()).increment(1);
    }

    /// Record a collapsed duplicate.
    pub fn record_duplicate(queue: QueueName) {
        counter!("guidepay.jobs.duplicate", "queue" => queue.as_str()).increment(1);
    }

    /// Record an acknowledged job.
    pub fn record_completed(queue: QueueName) {
        counter!("guidepay.jobs.completed", "queue" => queue.as_str()).increment(1);
    }

    /// Record a dead-lettered job.
    pub fn record_dead(queue: QueueName) {
        counter!("guidepay.jobs.dead", "queue" => queue.as_str()).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_starts_without_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn started_server_renders_registered_metrics() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();
        BookingMetrics::record_created(Duration::from_millis(3));

        let rendered = server.render().unwrap();
        assert!(rendered.contains("guidepay"));
    }

    #[test]
    fn recorders_are_noops_without_exporter() {
        BookingMetrics::record_created(Duration::from_millis(3));
        WebhookMetrics::record_processed("processed");
        FraudMetrics::record_scored(RiskLevel::Low);
        ReconciliationMetrics::record_finding(AnomalyType::OrphanPayment, Severity::High);
        JobMetrics::record_duplicate(QueueName::Analytics);
    }
}
