//! Side-effect jobs emitted after a payment transition commits.
//!
//! Job keys are derived from booking and payment ids only, so redelivered
//! webhooks produce the same keys and the broker collapses them.

use guidepay_core::queue::{EnqueueOutcome, JobQueue, JobRequest, QueueName};
use guidepay_core::types::{BookingId, GuideId, Money, PaymentId};
use guidepay_runtime::metrics::JobMetrics;
use serde_json::json;
use std::sync::Arc;

/// Jobs for a confirmed booking.
#[must_use]
pub fn payment_succeeded_jobs(
    booking_id: BookingId,
    payment_id: PaymentId,
    guide_id: GuideId,
    amount: Money,
) -> Vec<JobRequest> {
    vec![
        JobRequest::new(
            QueueName::GuideStats,
            format!("guide-stats:{booking_id}"),
            json!({ "guide_id": guide_id, "booking_id": booking_id }),
        ),
        JobRequest::new(
            QueueName::Analytics,
            format!("analytics:payment-succeeded:{payment_id}"),
            json!({
                "event": "payment_succeeded",
                "booking_id": booking_id,
                "payment_id": payment_id,
                "amount": amount,
            }),
        ),
        JobRequest::new(
            QueueName::Reconciliation,
            format!("reconciliation:payment:{payment_id}"),
            json!({ "payment_id": payment_id, "booking_id": booking_id }),
        ),
        JobRequest::new(
            QueueName::Notifications,
            format!("notifications:booking-confirmed:{booking_id}"),
            json!({ "template": "booking_confirmed", "booking_id": booking_id }),
        ),
    ]
}

/// Job for a failed payment.
#[must_use]
pub fn payment_failed_jobs(booking_id: BookingId, payment_id: PaymentId) -> Vec<JobRequest> {
    vec![JobRequest::new(
        QueueName::Reconciliation,
        format!("reconciliation:payment-failed:{payment_id}"),
        json!({ "payment_id": payment_id, "booking_id": booking_id }),
    )]
}

/// Enqueue `jobs` on a spawned task without awaiting it.
///
/// Enqueue failures are logged only; the caller's result never depends on them.
pub fn dispatch(queue: &Arc<dyn JobQueue>, jobs: Vec<JobRequest>) {
    if jobs.is_empty() {
        return;
    }
    let queue = Arc::clone(queue);
    tokio::spawn(async move {
        for job in jobs {
            let (name, key) = (job.queue, job.key.clone());
            match queue.enqueue(job).await {
                Ok(EnqueueOutcome::Enqueued) => {
                    JobMetrics::record_enqueued(name);
                    tracing::debug!(queue = %name, job_key = %key, "Job enqueued");
                }
                Ok(EnqueueOutcome::Duplicate) => {
                    JobMetrics::record_duplicate(name);
                    tracing::debug!(queue = %name, job_key = %key, "Job already enqueued");
                }
                Err(error) => {
                    tracing::warn!(queue = %name, job_key = %key, error = %error, "Failed to enqueue job");
                }
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use guidepay_testing::{InMemoryJobQueue, eventually};
    use std::time::Duration;

    #[test]
    fn success_keys_depend_only_on_ids() {
        let guide = GuideId::new();
        let first = payment_succeeded_jobs(BookingId::new(3), PaymentId::new(9), guide, Money::from_minor(2000));
        let again = payment_succeeded_jobs(BookingId::new(3), PaymentId::new(9), guide, Money::from_minor(2000));

        let keys: Vec<&str> = first.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "guide-stats:3",
                "analytics:payment-succeeded:9",
                "reconciliation:payment:9",
                "notifications:booking-confirmed:3",
            ]
        );
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn repeated_dispatch_collapses() {
        let queue = Arc::new(InMemoryJobQueue::default());
        let handle: Arc<dyn JobQueue> = queue.clone();
        let jobs = payment_failed_jobs(BookingId::new(1), PaymentId::new(2));

        dispatch(&handle, jobs.clone());
        dispatch(&handle, jobs);

        assert!(eventually(Duration::from_secs(1), || queue.jobs().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.keys(), vec!["reconciliation:payment-failed:2".to_string()]);
    }

    #[tokio::test]
    async fn broker_outage_is_swallowed() {
        let queue = Arc::new(InMemoryJobQueue::default());
        queue.set_available(false);
        let handle: Arc<dyn JobQueue> = queue.clone();

        dispatch(&handle, payment_failed_jobs(BookingId::new(1), PaymentId::new(2)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.jobs().is_empty());
    }
}
