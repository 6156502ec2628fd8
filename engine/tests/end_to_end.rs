//! Booking → intent → webhook → reconciliation against the in-memory adapters.

#![allow(clippy::unwrap_used)]

use guidepay_core::booking::{BookingPaymentStatus, BookingStatus};
use guidepay_core::commission::{CommissionRate, CommissionStatus};
use guidepay_core::environment::Clock;
use guidepay_core::pricing::RateCardPricing;
use guidepay_core::queue::QueueName;
use guidepay_core::reconciliation::{AnomalyType, Severity};
use guidepay_core::store::LedgerStore;
use guidepay_core::types::{Money, UserId};
use guidepay_engine::fraud::FraudContext;
use guidepay_engine::reconciliation::ReconciliationParams;
use guidepay_engine::signature;
use guidepay_engine::{
    BookingConfig, BookingService, CreateBookingRequest, FraudPolicy, FraudScorer, IntentConfig,
    IntentManager, ReconciliationConfig, ReconciliationEngine, WebhookConfig, WebhookOutcome,
    WebhookProcessor,
};
use guidepay_runtime::TtlCache;
use guidepay_testing::{
    InMemoryJobQueue, InMemoryLedger, MockPaymentProvider, RecordingAlertSink,
    StaticGuideDirectory, eventually, fixtures, init_test_tracing, test_clock,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "whsec_e2e";

#[tokio::test]
async fn booking_is_paid_confirmed_and_settled() {
    init_test_tracing();
    let rate = CommissionRate::from_bps(1_500);
    let ledger = InMemoryLedger::new();
    let provider = Arc::new(MockPaymentProvider::new());
    let queue = Arc::new(InMemoryJobQueue::default());
    let alerts = Arc::new(RecordingAlertSink::new());
    let clock = Arc::new(test_clock());
    let guide = fixtures::guide(1000);
    let user = UserId::new();

    let bookings = BookingService::new(
        ledger.clone(),
        Arc::new(StaticGuideDirectory::with_guides([guide.clone()])),
        Arc::new(RateCardPricing::default()),
        clock.clone(),
        BookingConfig::default(),
    );
    let intents = IntentManager::new(
        ledger.clone(),
        provider.clone(),
        clock.clone(),
        IntentConfig::default(),
    );
    let webhooks = WebhookProcessor::new(
        ledger.clone(),
        queue.clone(),
        alerts.clone(),
        clock.clone(),
        WebhookConfig {
            signing_secret: SECRET.to_string(),
            commission_rate: rate,
            ..WebhookConfig::default()
        },
    );
    let scorer = FraudScorer::new(
        Arc::new(ledger.clone()),
        Arc::new(TtlCache::default()),
        alerts.clone(),
        clock.clone(),
        FraudPolicy::default(),
    );

    let booking = bookings
        .create(CreateBookingRequest {
            user_id: user,
            guide_id: guide.id,
            start: fixtures::weekday_morning(),
            duration_minutes: 120,
            notes: Some("meet at the north gate".to_string()),
            add_ons: Vec::new(),
        })
        .await
        .unwrap();
    assert_eq!(booking.total(), Money::from_minor(2000));

    let assessment = scorer
        .assess(&FraudContext {
            user_id: user,
            booking_id: Some(booking.id),
            amount: booking.total(),
            ip_address: Some("198.51.100.4".to_string()),
        })
        .await;
    assert!(!assessment.should_block);

    let first = intents.create_or_reuse(booking.id).await.unwrap();
    let second = intents.create_or_reuse(booking.id).await.unwrap();
    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.intent.id, second.intent.id);
    assert_eq!(first.intent.amount, Money::from_minor(2000));

    let body = serde_json::to_vec(&json!({
        "id": "evt_e2e",
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": first.intent.id, "amount": 2000, "status": "succeeded" } }
    }))
    .unwrap();
    let header = signature::sign(&body, SECRET, clock.now().timestamp()).unwrap();
    assert_eq!(
        webhooks.handle(&body, &header).await.unwrap(),
        WebhookOutcome::Processed
    );

    let confirmed = ledger.find_booking(booking.id).await.unwrap().unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(confirmed.payment_status, BookingPaymentStatus::Paid);

    let commission = ledger.find_commission(booking.id).await.unwrap().unwrap();
    assert_eq!(commission.split.platform_amount, Money::from_minor(300));
    assert_eq!(
        commission.split.platform_amount + commission.split.guide_amount,
        Money::from_minor(2000)
    );
    assert_eq!(commission.status, CommissionStatus::Settled);

    assert!(
        eventually(Duration::from_secs(1), || {
            queue.jobs_in(QueueName::Notifications).len() == 1
                && queue.jobs_in(QueueName::GuideStats).len() == 1
        })
        .await
    );

    // A healthy ledger reconciles clean once the provider agrees.
    provider.set_status(
        &first.intent.id,
        guidepay_core::provider::ProviderIntentStatus::Succeeded,
    );
    let reconciliation = ReconciliationEngine::new(
        Arc::new(ledger.clone()),
        provider.clone(),
        alerts.clone(),
        clock.clone(),
        ReconciliationConfig::default(),
    );
    let report = reconciliation
        .run(&ReconciliationParams::new(chrono::Duration::days(7), 100))
        .await
        .unwrap();
    assert_eq!(report.findings_total, 0);
    assert_eq!(report.provider_checks, 1);
}

#[tokio::test]
async fn reconciliation_flags_seeded_drift() {
    let ledger = InMemoryLedger::new();
    let alerts = Arc::new(RecordingAlertSink::new());

    ledger.seed_booking(fixtures::paid_booking_row(1, 150, "pi_short")).await;
    ledger.seed_payment(fixtures::payment_row(1, 1, "pi_short", 100)).await;
    ledger.seed_payment(fixtures::payment_row(2, 77, "pi_orphan", 500)).await;
    ledger.seed_booking(fixtures::paid_booking_row(3, 900, "pi_dup")).await;
    ledger.seed_payment(fixtures::payment_row(3, 3, "pi_dup", 900)).await;
    ledger.seed_payment(fixtures::payment_row(4, 3, "pi_dup", 900)).await;

    let engine = ReconciliationEngine::new(
        Arc::new(ledger.clone()),
        Arc::new(MockPaymentProvider::new()),
        alerts.clone(),
        Arc::new(test_clock()),
        ReconciliationConfig::default(),
    );
    let params = ReconciliationParams::new(chrono::Duration::days(7), 2);
    let report = engine.run(&params).await.unwrap();

    let findings = ledger.findings().await;
    let of = |anomaly: AnomalyType| findings.iter().filter(|f| f.anomaly == anomaly).count();
    assert_eq!(of(AnomalyType::AmountMismatch), 1);
    assert_eq!(of(AnomalyType::OrphanPayment), 1);
    assert_eq!(of(AnomalyType::DuplicateIntent), 1);
    assert_eq!(report.findings_total, 3);
    assert_eq!(report.by_severity.get(&Severity::Critical), Some(&2));
    assert_eq!(report.by_severity.get(&Severity::High), Some(&1));
    assert_eq!(alerts.at_least(Severity::High).len(), 3);

    let again = engine.run(&params).await.unwrap();
    assert!(again.resumed);
    assert_eq!(ledger.findings().await.len(), 3);
}
