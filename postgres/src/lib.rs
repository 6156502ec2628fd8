//! `PostgreSQL` adapters for the guidepay core.
//!
//! This crate implements the store and queue ports of `guidepay-core` with sqlx:
//!
//! - [`PgLedgerStore`]: bookings, payments and commissions with row-level locks,
//!   a per-guide advisory lock and a partial unique index that allows at most one
//!   active payment per booking
//! - [`PgReconciliationStore`]: keyset-paginated audit scans, findings and run checkpoints
//! - [`PgFraudStore`]: activity snapshot and `fraud_events` audit trail
//! - [`PgJobQueue`]: durable side-effect jobs with key dedupe and dead-lettering
//!
//! Schema migrations are embedded and applied with [`migrate`].
//!
//! # Example
//!
//! ```no_run
//! use guidepay_postgres::{PgLedgerStore, PoolConfig, connect, migrate};
//!
//! # async fn example() -> Result<(), guidepay_core::StoreError> {
//! let pool = connect(&PoolConfig::new("postgres://localhost/guidepay")).await?;
//! migrate(&pool).await?;
//! let ledger = PgLedgerStore::new(pool);
//! # Ok(())
//! # }
//! ```

mod error;
mod rows;

pub mod fraud;
pub mod ledger;
pub mod queue;
pub mod reconciliation;

pub use fraud::PgFraudStore;
pub use ledger::{PgLedgerStore, PgTx};
pub use queue::{JobQueueConfig, JobRecord, PgJobQueue};
pub use reconciliation::PgReconciliationStore;

use guidepay_core::error::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection URL
    pub url: String,
    /// Upper bound on open connections
    pub max_connections: u32,
    /// Connections kept open while idle
    pub min_connections: u32,
    /// Wait for a free connection before failing with a retryable error
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed
    pub idle_timeout: Duration,
}

impl PoolConfig {
    /// Defaults for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError`] if the database cannot be reached.
pub async fn connect(config: &PoolConfig) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.url)
        .await
        .map_err(error::store_error)
}

/// Apply the embedded schema migrations.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
    tracing::info!("Database migrations applied");
    Ok(())
}
