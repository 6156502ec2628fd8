//! Periodic reconciliation runs.
//!
//! One run per tick. A run that fails mid-way is resumed with the same run id
//! on the next tick, so its checkpoint and findings carry over.

use guidepay_engine::reconciliation::{
    ReconciliationEngine, ReconciliationParams, ReconciliationReport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Schedule settings.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    /// Time between run starts
    pub interval: Duration,
    /// Audit window of each run
    pub lookback: chrono::Duration,
    /// Rows per scan batch
    pub batch_size: u32,
}

/// Drives an engine on a fixed interval.
pub struct ReconciliationScheduler {
    engine: Arc<ReconciliationEngine>,
    settings: ScheduleSettings,
    pending: Option<ReconciliationParams>,
}

impl ReconciliationScheduler {
    /// Create a scheduler.
    #[must_use]
    pub const fn new(engine: Arc<ReconciliationEngine>, settings: ScheduleSettings) -> Self {
        Self {
            engine,
            settings,
            pending: None,
        }
    }

    /// Run once: resume the unfinished run if there is one, else start a new run.
    ///
    /// Returns the report of a completed run; failures are logged and the
    /// run is kept for the next call.
    pub async fn tick(&mut self) -> Option<ReconciliationReport> {
        let params = self.pending.take().unwrap_or_else(|| {
            ReconciliationParams::new(self.settings.lookback, self.settings.batch_size)
        });

        match self.engine.run(&params).await {
            Ok(report) => Some(report),
            Err(error) => {
                tracing::error!(run_id = %params.run_id, error = %error, "Reconciliation run failed; will resume");
                self.pending = Some(params);
                None
            }
        }
    }

    /// Tick until `shutdown` turns `true`. The first run starts immediately.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = self.settings.interval.as_secs(), "Reconciliation scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciliation scheduler stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use guidepay_engine::config::ReconciliationConfig;
    use guidepay_testing::{InMemoryLedger, MockPaymentProvider, RecordingAlertSink, fixtures, test_clock};

    fn scheduler(ledger: &InMemoryLedger) -> ReconciliationScheduler {
        let engine = ReconciliationEngine::new(
            Arc::new(ledger.clone()),
            Arc::new(MockPaymentProvider::new()),
            Arc::new(RecordingAlertSink::new()),
            Arc::new(test_clock()),
            ReconciliationConfig::default(),
        );
        ReconciliationScheduler::new(
            Arc::new(engine),
            ScheduleSettings {
                interval: Duration::from_millis(10),
                lookback: chrono::Duration::days(365),
                batch_size: 10,
            },
        )
    }

    #[tokio::test]
    async fn each_tick_starts_a_fresh_run() {
        let ledger = InMemoryLedger::new();
        ledger.seed_booking(fixtures::paid_booking_row(1, 2000, "pi_1")).await;
        ledger.seed_payment(fixtures::payment_row(1, 1, "pi_1", 1500)).await;
        let mut scheduler = scheduler(&ledger);

        let first = scheduler.tick().await.unwrap();
        let second = scheduler.tick().await.unwrap();

        assert_ne!(first.run_id, second.run_id);
        assert!(first.findings_total >= 1);
        assert_eq!(first.findings_total, second.findings_total);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let ledger = InMemoryLedger::new();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler(&ledger).run(rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
