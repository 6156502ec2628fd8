//! In-memory job queue.

#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use guidepay_core::BoxFuture;
use guidepay_core::queue::{
    ClaimedJob, EnqueueOutcome, JobQueue, JobRequest, JobSource, JobStatus, QueueError, QueueName,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// A job as stored by [`InMemoryJobQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJob {
    /// Broker id
    pub id: i64,
    /// Original request
    pub request: JobRequest,
    /// Delivery state
    pub status: JobStatus,
    /// Claims so far
    pub attempts: u32,
    /// Last failure message
    pub last_error: Option<String>,
    /// Enqueue time
    pub enqueued_at: DateTime<Utc>,
}

/// Job queue double with job-key dedupe and dead-lettering.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<StoredJob>>,
    max_attempts: u32,
    unavailable: AtomicBool,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(5)
    }
}

impl InMemoryJobQueue {
    /// Create a queue that dead-letters after `max_attempts` failed claims.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            max_attempts: max_attempts.max(1),
            unavailable: AtomicBool::new(false),
        }
    }

    fn jobs_mut(&self) -> std::sync::MutexGuard<'_, Vec<StoredJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail with [`QueueError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// All stored jobs, in enqueue order.
    #[must_use]
    pub fn jobs(&self) -> Vec<StoredJob> {
        self.jobs_mut().clone()
    }

    /// Keys of all stored jobs, in enqueue order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.jobs_mut().iter().map(|j| j.request.key.clone()).collect()
    }

    /// Stored jobs of one queue.
    #[must_use]
    pub fn jobs_in(&self, queue: QueueName) -> Vec<StoredJob> {
        self.jobs_mut()
            .iter()
            .filter(|j| j.request.queue == queue)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("broker offline".to_string()));
        }
        Ok(())
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: JobRequest) -> BoxFuture<'_, Result<EnqueueOutcome, QueueError>> {
        Box::pin(async move {
            self.check_available()?;
            let mut jobs = self.jobs_mut();
            if jobs.iter().any(|j| j.request.key == job.key) {
                return Ok(EnqueueOutcome::Duplicate);
            }
            let id = i64::try_from(jobs.len()).unwrap_or(i64::MAX) + 1;
            jobs.push(StoredJob {
                id,
                request: job,
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                enqueued_at: Utc::now(),
            });
            Ok(EnqueueOutcome::Enqueued)
        })
    }
}

impl JobSource for InMemoryJobQueue {
    fn claim(
        &self,
        queue: QueueName,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<ClaimedJob>, QueueError>> {
        Box::pin(async move {
            self.check_available()?;
            let mut jobs = self.jobs_mut();
            Ok(jobs
                .iter_mut()
                .filter(|j| j.request.queue == queue && j.status == JobStatus::Pending)
                .take(limit as usize)
                .map(|j| {
                    j.status = JobStatus::Running;
                    j.attempts += 1;
                    ClaimedJob {
                        id: j.id,
                        queue: j.request.queue,
                        key: j.request.key.clone(),
                        payload: j.request.payload.clone(),
                        attempt: j.attempts,
                        enqueued_at: j.enqueued_at,
                    }
                })
                .collect())
        })
    }

    fn complete(&self, job_id: i64) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            self.check_available()?;
            if let Some(job) = self.jobs_mut().iter_mut().find(|j| j.id == job_id) {
                job.status = JobStatus::Completed;
            }
            Ok(())
        })
    }

    fn fail<'a>(&'a self, job_id: i64, error: &'a str) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            self.check_available()?;
            if let Some(job) = self.jobs_mut().iter_mut().find(|j| j.id == job_id) {
                job.last_error = Some(error.to_string());
                job.status = if job.attempts >= self.max_attempts {
                    JobStatus::Dead
                } else {
                    JobStatus::Pending
                };
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn job(key: &str) -> JobRequest {
        JobRequest::new(QueueName::Analytics, key, serde_json::json!({}))
    }

    #[tokio::test]
    async fn duplicate_keys_collapse() {
        let queue = InMemoryJobQueue::default();
        assert_eq!(queue.enqueue(job("a")).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(queue.enqueue(job("a")).await.unwrap(), EnqueueOutcome::Duplicate);
        assert_eq!(queue.keys(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn exhausted_jobs_are_dead_lettered() {
        let queue = InMemoryJobQueue::new(2);
        queue.enqueue(job("a")).await.unwrap();

        for _ in 0..2 {
            let claimed = queue.claim(QueueName::Analytics, 10).await.unwrap();
            assert_eq!(claimed.len(), 1);
            queue.fail(claimed[0].id, "boom").await.unwrap();
        }

        assert!(queue.claim(QueueName::Analytics, 10).await.unwrap().is_empty());
        assert_eq!(queue.jobs()[0].status, JobStatus::Dead);
    }
}
