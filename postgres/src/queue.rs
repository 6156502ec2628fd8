//! Durable job queue over the `jobs` table.
//!
//! - **Dedupe**: `job_key` is unique; enqueueing an existing key is a no-op
//!   reported as [`EnqueueOutcome::Duplicate`].
//! - **Claim**: `FOR UPDATE SKIP LOCKED`, so concurrent consumers never see
//!   the same job.
//! - **Retry**: a failed job goes back to `pending` with a linear backoff
//!   (`attempts × retry_backoff`).
//! - **Dead-letter**: once `attempts` reaches `max_attempts` the job is parked
//!   in `dead` for manual inspection.

use crate::error::{narrow, store_error};
use crate::rows::col;
use chrono::{DateTime, Utc};
use guidepay_core::BoxFuture;
use guidepay_core::error::StoreError;
use guidepay_core::queue::{
    ClaimedJob, EnqueueOutcome, JobQueue, JobRequest, JobSource, JobStatus, QueueError, QueueName,
};
use sqlx::PgPool;
use sqlx::postgres::PgRow;
use std::time::Duration;

/// Retry settings of a [`PgJobQueue`].
#[derive(Debug, Clone, Copy)]
pub struct JobQueueConfig {
    /// Claims before a failing job is dead-lettered
    pub max_attempts: u32,
    /// Backoff unit; the n-th retry waits `n × retry_backoff`
    pub retry_backoff: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff: Duration::from_secs(30),
        }
    }
}

/// A job row, as listed for operators.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Row id
    pub id: i64,
    /// Target queue
    pub queue: QueueName,
    /// Dedupe key
    pub key: String,
    /// Delivery state
    pub status: JobStatus,
    /// Claims so far
    pub attempts: u32,
    /// Last failure message
    pub last_error: Option<String>,
    /// Enqueue time
    pub enqueued_at: DateTime<Utc>,
}

/// `PostgreSQL`-backed [`JobQueue`] and [`JobSource`].
///
/// # Example
///
/// ```no_run
/// use guidepay_postgres::{JobQueueConfig, PgJobQueue};
/// use guidepay_core::queue::{JobQueue, JobRequest, QueueName};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let queue = PgJobQueue::new(pool, JobQueueConfig::default());
/// queue
///     .enqueue(JobRequest::new(QueueName::Analytics, "analytics:payment-succeeded:7", serde_json::json!({})))
///     .await?;
///
/// let dead = queue.list_by_status(guidepay_core::queue::JobStatus::Dead, 100).await?;
/// println!("Dead jobs: {}", dead.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    config: JobQueueConfig,
}

fn unavailable(err: StoreError) -> QueueError {
    QueueError::Unavailable(err.to_string())
}

fn queue_error(err: sqlx::Error) -> QueueError {
    unavailable(store_error(err))
}

impl PgJobQueue {
    /// Create a queue over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool, config: JobQueueConfig) -> Self {
        Self { pool, config }
    }

    /// Jobs in `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let limit: i64 = narrow(limit, "limit")?;
        let rows = sqlx::query(
            r"
            SELECT id, queue, job_key, status, attempts, last_error, enqueued_at
            FROM jobs
            WHERE status = $1
            ORDER BY enqueued_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    /// Number of dead-lettered jobs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn count_dead(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = 'dead'")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(count)
    }

    /// Put a dead job back in line with a fresh attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub async fn requeue_dead(&self, job_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = 'pending', attempts = 0, run_after = now(), updated_at = now()
            WHERE id = $1 AND status = 'dead'
            ",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        let requeued = result.rows_affected() == 1;
        if requeued {
            tracing::info!(job_id, "Dead job requeued");
        }
        Ok(requeued)
    }

    fn row_to_record(row: &PgRow) -> Result<JobRecord, StoreError> {
        Ok(JobRecord {
            id: col(row, "id")?,
            queue: QueueName::parse(&col::<String>(row, "queue")?)?,
            key: col(row, "job_key")?,
            status: JobStatus::parse(&col::<String>(row, "status")?)?,
            attempts: narrow(col::<i32>(row, "attempts")?, "attempts")?,
            last_error: col(row, "last_error")?,
            enqueued_at: col(row, "enqueued_at")?,
        })
    }

    fn row_to_claimed(row: &PgRow) -> Result<ClaimedJob, StoreError> {
        Ok(ClaimedJob {
            id: col(row, "id")?,
            queue: QueueName::parse(&col::<String>(row, "queue")?)?,
            key: col(row, "job_key")?,
            payload: col(row, "payload")?,
            attempt: narrow(col::<i32>(row, "attempts")?, "attempts")?,
            enqueued_at: col(row, "enqueued_at")?,
        })
    }
}

impl JobQueue for PgJobQueue {
    fn enqueue(&self, job: JobRequest) -> BoxFuture<'_, Result<EnqueueOutcome, QueueError>> {
        Box::pin(async move {
            if job.key.is_empty() {
                return Err(QueueError::Invalid("job key must not be empty".to_string()));
            }
            let inserted: Option<(i64,)> = sqlx::query_as(
                r"
                INSERT INTO jobs (queue, job_key, payload)
                VALUES ($1, $2, $3)
                ON CONFLICT (job_key) DO NOTHING
                RETURNING id
                ",
            )
            .bind(job.queue.as_str())
            .bind(&job.key)
            .bind(&job.payload)
            .fetch_optional(&self.pool)
            .await
            .map_err(queue_error)?;

            match inserted {
                Some((id,)) => {
                    tracing::debug!(job_id = id, queue = %job.queue, key = %job.key, "Job enqueued");
                    Ok(EnqueueOutcome::Enqueued)
                }
                None => Ok(EnqueueOutcome::Duplicate),
            }
        })
    }
}

impl JobSource for PgJobQueue {
    fn claim(
        &self,
        queue: QueueName,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<ClaimedJob>, QueueError>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                UPDATE jobs
                SET status = 'running', attempts = attempts + 1, updated_at = now()
                WHERE id IN (
                    SELECT id
                    FROM jobs
                    WHERE queue = $1 AND status = 'pending' AND run_after <= now()
                    ORDER BY id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, queue, job_key, payload, attempts, enqueued_at
                ",
            )
            .bind(queue.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(queue_error)?;

            let mut claimed = rows
                .iter()
                .map(Self::row_to_claimed)
                .collect::<Result<Vec<_>, _>>()
                .map_err(unavailable)?;
            claimed.sort_by_key(|job| job.id);
            Ok(claimed)
        })
    }

    fn complete(&self, job_id: i64) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE jobs
                SET status = 'completed', completed_at = now(), updated_at = now()
                WHERE id = $1
                ",
            )
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;
            Ok(())
        })
    }

    fn fail<'a>(&'a self, job_id: i64, error: &'a str) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            let max_attempts = i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX);
            let backoff_secs = f64::from(
                u32::try_from(self.config.retry_backoff.as_secs()).unwrap_or(u32::MAX),
            );
            let row: Option<(String, String, i32)> = sqlx::query_as(
                r"
                UPDATE jobs
                SET status = CASE WHEN attempts >= $2 THEN 'dead' ELSE 'pending' END,
                    last_error = $3,
                    run_after = now() + make_interval(secs => attempts * $4),
                    updated_at = now()
                WHERE id = $1
                RETURNING status, queue, attempts
                ",
            )
            .bind(job_id)
            .bind(max_attempts)
            .bind(error)
            .bind(backoff_secs)
            .fetch_optional(&self.pool)
            .await
            .map_err(queue_error)?;

            match row.as_ref().map(|(status, queue, attempts)| (status.as_str(), queue, attempts)) {
                Some(("dead", queue, attempts)) => {
                    tracing::warn!(job_id, queue = %queue, attempts, error, "Job moved to dead-letter");
                }
                Some((_, queue, attempts)) => {
                    tracing::info!(job_id, queue = %queue, attempts, error, "Job scheduled for retry");
                }
                None => tracing::warn!(job_id, "Failed job not found"),
            }
            Ok(())
        })
    }
}
