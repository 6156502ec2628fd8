//! Composition root.
//!
//! Wires the Postgres adapters, the HTTP clients and the shared runtime pieces
//! into the five engine components and the queue handlers.

use crate::config::Config;
use crate::directory::HttpGuideDirectory;
use crate::jobs::{
    AnalyticsHandler, ConsumerSettings, GuideStatsHandler, JobHandler, NotificationHandler,
    PaymentAuditHandler,
};
use crate::provider::HttpPaymentProvider;
use crate::scheduler::{ReconciliationScheduler, ScheduleSettings};
use guidepay_core::alert::AlertSink;
use guidepay_core::environment::{Clock, SystemClock};
use guidepay_core::pricing::RateCardPricing;
use guidepay_core::provider::PaymentProvider;
use guidepay_core::queue::{JobQueue, JobSource, QueueName};
use guidepay_core::store::ReconciliationStore;
use guidepay_engine::{
    BookingService, FraudPolicy, FraudScorer, IntentManager, ReconciliationEngine,
    WebhookProcessor,
};
use guidepay_postgres::{PgFraudStore, PgJobQueue, PgLedgerStore, PgReconciliationStore};
use guidepay_runtime::alerting::{InMemoryWindowCounter, RateLimitedAlerter, TracingAlertSink};
use guidepay_runtime::cache::TtlCache;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on cached fraud activity snapshots.
const FRAUD_CACHE_ENTRIES: usize = 10_000;

/// Every long-lived component of the process.
pub struct Services {
    /// Booking creation and status changes
    pub bookings: BookingService<PgLedgerStore>,
    /// Payment intent creation
    pub intents: IntentManager<PgLedgerStore>,
    /// Provider callbacks
    pub webhooks: WebhookProcessor<PgLedgerStore>,
    /// Transaction risk scoring
    pub fraud: FraudScorer,
    /// Ledger audit
    pub reconciliation: Arc<ReconciliationEngine>,
    /// Durable side-effect queue
    pub queue: Arc<PgJobQueue>,
    /// Rate-limited alert dispatch
    pub alerts: Arc<dyn AlertSink>,
    ledger: PgLedgerStore,
    findings: Arc<dyn ReconciliationStore>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl Services {
    /// Build every component over `pool`.
    #[must_use]
    pub fn build(config: &Config, pool: PgPool) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let alerts: Arc<dyn AlertSink> = Arc::new(RateLimitedAlerter::new(
            Arc::new(TracingAlertSink),
            Arc::clone(&clock),
            Arc::new(InMemoryWindowCounter::new()),
            config.alert_limits(),
        ));

        let ledger = PgLedgerStore::new(pool.clone()).with_lock_timeout(config.lock_timeout());
        let findings: Arc<dyn ReconciliationStore> = Arc::new(PgReconciliationStore::new(pool.clone()));
        let queue = Arc::new(PgJobQueue::new(pool.clone(), config.job_queue()));
        let provider: Arc<dyn PaymentProvider> = Arc::new(HttpPaymentProvider::new(
            config.provider.base_url.clone(),
            config.provider.secret_key.clone(),
            Duration::from_secs(config.provider.request_timeout),
        ));
        let directory = Arc::new(HttpGuideDirectory::new(
            config.directory.base_url.clone(),
            Duration::from_secs(config.directory.request_timeout),
        ));

        Self {
            bookings: BookingService::new(
                ledger.clone(),
                directory,
                Arc::new(RateCardPricing::default()),
                Arc::clone(&clock),
                config.booking(),
            ),
            intents: IntentManager::new(
                ledger.clone(),
                Arc::clone(&provider),
                Arc::clone(&clock),
                config.intent(),
            ),
            webhooks: WebhookProcessor::new(
                ledger.clone(),
                Arc::clone(&queue) as Arc<dyn JobQueue>,
                Arc::clone(&alerts),
                Arc::clone(&clock),
                config.webhook(),
            ),
            fraud: FraudScorer::new(
                Arc::new(PgFraudStore::new(pool)),
                Arc::new(TtlCache::new(FRAUD_CACHE_ENTRIES)),
                Arc::clone(&alerts),
                Arc::clone(&clock),
                FraudPolicy::default(),
            ),
            reconciliation: Arc::new(ReconciliationEngine::new(
                Arc::clone(&findings),
                provider,
                Arc::clone(&alerts),
                Arc::clone(&clock),
                config.reconciliation(),
            )),
            queue,
            alerts,
            ledger,
            findings,
            clock,
            config: config.clone(),
        }
    }

    /// Handler and consumer settings for each queue.
    #[must_use]
    pub fn consumers(&self) -> Vec<(QueueName, Arc<dyn JobHandler>, ConsumerSettings)> {
        let queues = &self.config.queues;
        let settings = |concurrency| ConsumerSettings {
            batch_size: queues.batch_size,
            concurrency,
            poll_interval: Duration::from_millis(queues.poll_interval_ms),
            max_attempts: queues.max_attempts,
        };

        vec![
            (
                QueueName::GuideStats,
                Arc::new(GuideStatsHandler::new(self.ledger.clone())) as Arc<dyn JobHandler>,
                settings(queues.guide_stats_concurrency),
            ),
            (
                QueueName::Analytics,
                Arc::new(AnalyticsHandler),
                settings(queues.analytics_concurrency),
            ),
            (
                QueueName::Reconciliation,
                Arc::new(PaymentAuditHandler::new(
                    self.ledger.clone(),
                    Arc::clone(&self.findings),
                    Arc::clone(&self.alerts),
                    Arc::clone(&self.clock),
                    self.config.engine.amount_epsilon,
                )),
                settings(queues.reconciliation_concurrency),
            ),
            (
                QueueName::Notifications,
                Arc::new(NotificationHandler),
                settings(queues.notifications_concurrency),
            ),
        ]
    }

    /// The job source the consumers claim from.
    #[must_use]
    pub fn job_source(&self) -> Arc<dyn JobSource> {
        Arc::clone(&self.queue) as Arc<dyn JobSource>
    }

    /// Periodic reconciliation driver.
    #[must_use]
    pub fn scheduler(&self) -> ReconciliationScheduler {
        let schedule = &self.config.reconciliation;
        ReconciliationScheduler::new(
            Arc::clone(&self.reconciliation),
            ScheduleSettings {
                interval: Duration::from_secs(schedule.interval.max(1)),
                lookback: chrono::Duration::hours(schedule.lookback_hours.max(1)),
                batch_size: schedule.batch_size,
            },
        )
    }
}
