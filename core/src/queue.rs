//! Durable job queue port.
//!
//! Side effects of financial operations (stats refresh, analytics, notifications,
//! reconciliation triggers) are handed to a queue with at-least-once delivery.
//! Each job carries a caller-derived key; the broker collapses jobs that share a
//! key, so a redelivered webhook that enqueues the same side effect twice still
//! results in a single execution.

use crate::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

text_enum! {
    /// Named queues consumed by the worker.
    pub enum QueueName {
        /// Guide performance counters
        GuideStats => "guide_stats",
        /// Analytics events
        Analytics => "analytics",
        /// Reconciliation triggers
        Reconciliation => "reconciliation",
        /// Customer and guide notifications
        Notifications => "notifications",
    }
}

text_enum! {
    /// Delivery state of a stored job.
    pub enum JobStatus {
        /// Waiting to be claimed
        Pending => "pending",
        /// Claimed by a consumer
        Running => "running",
        /// Acknowledged
        Completed => "completed",
        /// Attempts exhausted; kept for inspection
        Dead => "dead",
    }
}

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Target queue
    pub queue: QueueName,
    /// Deduplication key (the job id)
    pub key: String,
    /// Job arguments
    pub payload: serde_json::Value,
}

impl JobRequest {
    /// Create a job request.
    #[must_use]
    pub fn new(queue: QueueName, key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue,
            key: key.into(),
            payload,
        }
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was stored
    Enqueued,
    /// A job with the same key already exists; nothing was stored
    Duplicate,
}

/// A job claimed by a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedJob {
    /// Broker-assigned id
    pub id: i64,
    /// Queue it came from
    pub queue: QueueName,
    /// Deduplication key
    pub key: String,
    /// Job arguments
    pub payload: serde_json::Value,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    /// When the job was first enqueued
    pub enqueued_at: DateTime<Utc>,
}

/// Queue failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Broker unreachable
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
    /// Job could not be encoded/decoded
    #[error("Invalid job: {0}")]
    Invalid(String),
}

/// Producer side of the queue.
pub trait JobQueue: Send + Sync {
    /// Enqueue a job, collapsing duplicates by key.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the broker cannot accept the job.
    fn enqueue(&self, job: JobRequest) -> BoxFuture<'_, Result<EnqueueOutcome, QueueError>>;
}

/// Consumer side of the queue.
pub trait JobSource: Send + Sync {
    /// Claim up to `limit` ready jobs from `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the broker cannot be reached.
    fn claim(&self, queue: QueueName, limit: u32) -> BoxFuture<'_, Result<Vec<ClaimedJob>, QueueError>>;

    /// Acknowledge a job as done.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the broker cannot be reached.
    fn complete(&self, job_id: i64) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Report a failed attempt; the broker retries or dead-letters the job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the broker cannot be reached.
    fn fail<'a>(&'a self, job_id: i64, error: &'a str) -> BoxFuture<'a, Result<(), QueueError>>;
}
