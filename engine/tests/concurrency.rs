//! Concurrent callers racing on the same guide, booking and payment.

#![allow(clippy::unwrap_used)]

use futures::future::join_all;
use guidepay_core::commission::CommissionRate;
use guidepay_core::environment::Clock;
use guidepay_core::pricing::RateCardPricing;
use guidepay_core::store::LedgerStore;
use guidepay_core::types::{BookingId, PaymentId, UserId};
use guidepay_engine::signature;
use guidepay_engine::{
    BookingConfig, BookingError, BookingService, CreateBookingRequest, IntentConfig,
    IntentManager, WebhookConfig, WebhookOutcome, WebhookProcessor,
};
use guidepay_testing::{
    InMemoryJobQueue, InMemoryLedger, MockPaymentProvider, RecordingAlertSink,
    StaticGuideDirectory, eventually, fixtures, test_clock,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn overlapping_requests_admit_exactly_one() {
    let ledger = InMemoryLedger::new();
    let guide = fixtures::guide(1000);
    let service = Arc::new(BookingService::new(
        ledger.clone(),
        Arc::new(StaticGuideDirectory::with_guides([guide.clone()])),
        Arc::new(RateCardPricing::default()),
        Arc::new(test_clock()),
        BookingConfig::default(),
    ));
    let start = fixtures::weekday_morning();

    let handles = (0..8i64).map(|i| {
        let service = Arc::clone(&service);
        let request = CreateBookingRequest {
            user_id: UserId::new(),
            guide_id: guide.id,
            start: start + chrono::Duration::minutes(15 * (i % 3)),
            duration_minutes: 60,
            notes: None,
            add_ons: Vec::new(),
        };
        tokio::spawn(async move { service.create(request).await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(BookingError::Conflict { .. })))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(ledger.bookings().await.len(), 1);
}

#[tokio::test]
async fn concurrent_intent_requests_share_one_payment() {
    let ledger = InMemoryLedger::new();
    let provider = Arc::new(MockPaymentProvider::new());
    ledger.seed_booking(fixtures::booking_row(1, 2000)).await;
    let manager = Arc::new(IntentManager::new(
        ledger.clone(),
        provider.clone(),
        Arc::new(test_clock()),
        IntentConfig::default(),
    ));

    let handles = (0..10).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.create_or_reuse(BookingId::new(1)).await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let first = &results[0].intent.id;
    assert!(results.iter().all(|r| &r.intent.id == first));
    assert_eq!(results.iter().filter(|r| !r.reused).count(), 1);
    assert_eq!(ledger.payments().await.len(), 1);
    assert_eq!(provider.intent_count(), 1);
}

#[tokio::test]
async fn concurrent_success_deliveries_apply_once() {
    const SECRET: &str = "whsec_concurrency";
    let ledger = InMemoryLedger::new();
    let queue = Arc::new(InMemoryJobQueue::default());
    let mut booking = fixtures::booking_row(1, 2000);
    booking.payment_intent_id = Some("pi_race".to_string());
    ledger.seed_booking(booking).await;
    ledger
        .seed_payment(fixtures::new_payment(BookingId::new(1), "pi_race", 2000).into_payment(PaymentId::new(1)))
        .await;

    let processor = Arc::new(WebhookProcessor::new(
        ledger.clone(),
        queue.clone(),
        Arc::new(RecordingAlertSink::new()),
        Arc::new(test_clock()),
        WebhookConfig {
            signing_secret: SECRET.to_string(),
            commission_rate: CommissionRate::from_bps(1_500),
            ..WebhookConfig::default()
        },
    ));

    let body = serde_json::to_vec(&json!({
        "id": "evt_race",
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_race" } }
    }))
    .unwrap();
    let header = signature::sign(&body, SECRET, test_clock().now().timestamp()).unwrap();

    let handles = (0..6).map(|_| {
        let processor = Arc::clone(&processor);
        let (body, header) = (body.clone(), header.clone());
        tokio::spawn(async move { processor.handle(&body, &header).await })
    });
    let outcomes: Vec<WebhookOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(
        outcomes.iter().filter(|o| **o == WebhookOutcome::Processed).count(),
        1
    );
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, WebhookOutcome::Processed | WebhookOutcome::AlreadyProcessed)));
    assert_eq!(ledger.commissions().await.len(), 1);

    let booking = ledger.find_booking(BookingId::new(1)).await.unwrap().unwrap();
    let earnings = ledger.guide_earnings(booking.guide_id).await.unwrap();
    assert_eq!(earnings.paid_bookings, 1);

    assert!(eventually(Duration::from_secs(1), || queue.jobs().len() == 4).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.jobs().len(), 4);
}
