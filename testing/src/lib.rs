//! # Guidepay Testing
//!
//! In-memory adapters and fixtures for exercising the guidepay core without
//! infrastructure.
//!
//! - [`InMemoryLedger`]: ledger, reconciliation and fraud store with
//!   serialisable transactions and fault injection
//! - [`MockPaymentProvider`]: provider with idempotency-key dedupe and failure injection
//! - [`InMemoryJobQueue`]: job queue with job-key dedupe and dead-lettering
//! - [`RecordingAlertSink`], [`StaticGuideDirectory`]
//! - [`FixedClock`] / [`ManualClock`] and the [`fixtures`] module
//!
//! ## Example
//!
//! ```ignore
//! use guidepay_testing::{InMemoryLedger, MockPaymentProvider, test_clock};
//!
//! #[tokio::test]
//! async fn intent_is_reused() {
//!     let ledger = InMemoryLedger::new();
//!     let provider = Arc::new(MockPaymentProvider::new());
//!     let manager = IntentManager::new(ledger.clone(), provider, Arc::new(test_clock()), IntentConfig::default());
//!     // ...
//! }
//! ```

pub mod alerts;
pub mod clock;
pub mod directory;
pub mod fixtures;
pub mod ledger;
pub mod provider;
pub mod queue;

pub use alerts::RecordingAlertSink;
pub use clock::{FixedClock, ManualClock, test_clock};
pub use directory::StaticGuideDirectory;
pub use ledger::{InMemoryLedger, InMemoryTx, LedgerState, RowLock};
pub use provider::MockPaymentProvider;
pub use queue::InMemoryJobQueue;

/// Install a test tracing subscriber honouring `RUST_LOG`; safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses; returns the final result.
///
/// For asserting on work the code under test hands to a spawned task.
pub async fn eventually<F>(timeout: std::time::Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
