//! Fraud risk scorer.
//!
//! Six behavioural signals pass through fixed step functions into `[0, 1]`, are
//! weighted, and summed into a score in `[0, 100]`. The weights, steps and band
//! thresholds live in [`FraudPolicy`] and can be swapped without touching the
//! scorer.
//!
//! The scorer fails open. If activity cannot be read, the assessment is
//! score 0 / low / allow with `degraded = true`; persisting the audit event and
//! dispatching alerts are best-effort as well.

use chrono::{DateTime, Utc};
use guidepay_core::alert::{Alert, AlertSink};
use guidepay_core::cache::Cache;
use guidepay_core::environment::Clock;
use guidepay_core::fraud::{
    ActivitySnapshot, FraudDecision, FraudEvent, FraudSignal, RiskLevel, SignalContribution,
};
use guidepay_core::reconciliation::Severity;
use guidepay_core::store::FraudStore;
use guidepay_core::types::{BookingId, Money, UserId};
use guidepay_runtime::metrics::FraudMetrics;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// One step of a step function: inputs `>= at_least` map to `factor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    /// Lower bound of the step
    pub at_least: f64,
    /// Output in `[0, 1]`
    pub factor: f64,
}

const fn step(at_least: f64, factor: f64) -> Step {
    Step { at_least, factor }
}

/// Weight and step function of one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRule {
    /// Signal
    pub signal: FraudSignal,
    /// Points awarded at factor 1
    pub weight: u32,
    /// Steps in ascending `at_least` order
    pub steps: Vec<Step>,
}

impl SignalRule {
    /// Factor of the last step whose bound `raw` reaches; 0 below the first step.
    #[must_use]
    pub fn factor(&self, raw: f64) -> f64 {
        self.steps
            .iter()
            .take_while(|s| s.at_least <= raw)
            .last()
            .map_or(0.0, |s| s.factor.clamp(0.0, 1.0))
    }
}

/// Weights, step functions and thresholds of the scorer.
///
/// The defaults are hand-tuned constants, not a calibrated model.
#[derive(Debug, Clone, PartialEq)]
pub struct FraudPolicy {
    /// One rule per signal
    pub rules: Vec<SignalRule>,
    /// Lowest medium score
    pub medium_from: u8,
    /// Lowest high score
    pub high_from: u8,
    /// Lowest critical score
    pub critical_from: u8,
    /// Scores at or above this always block
    pub block_from: u8,
    /// Payment attempts within ten minutes that count as a burst
    pub retry_burst_attempts: u32,
    /// Lifetime of cached activity snapshots
    pub snapshot_ttl: Duration,
}

impl Default for FraudPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                SignalRule {
                    signal: FraudSignal::Velocity,
                    weight: 22,
                    steps: vec![step(0.0, 0.0), step(2.0, 0.3), step(3.0, 0.6), step(5.0, 1.0)],
                },
                SignalRule {
                    signal: FraudSignal::FailureRatio,
                    weight: 20,
                    steps: vec![step(0.0, 0.0), step(0.1, 0.4), step(0.3, 0.7), step(0.5, 1.0)],
                },
                SignalRule {
                    signal: FraudSignal::PriceDeviation,
                    weight: 18,
                    steps: vec![step(0.0, 0.0), step(0.5, 0.4), step(1.0, 0.7), step(2.0, 1.0)],
                },
                SignalRule {
                    signal: FraudSignal::AccountAge,
                    weight: 12,
                    steps: vec![step(0.0, 1.0), step(1.0, 0.7), step(7.0, 0.3), step(30.0, 0.0)],
                },
                SignalRule {
                    signal: FraudSignal::IpReputation,
                    weight: 14,
                    steps: vec![step(0.0, 0.0), step(1.0, 0.3), step(2.0, 0.6), step(4.0, 1.0)],
                },
                SignalRule {
                    signal: FraudSignal::RetryBurst,
                    weight: 14,
                    steps: vec![step(0.0, 0.0), step(3.0, 0.5), step(5.0, 1.0)],
                },
            ],
            medium_from: 30,
            high_from: 60,
            critical_from: 80,
            block_from: 90,
            retry_burst_attempts: 3,
            snapshot_ttl: Duration::from_secs(60),
        }
    }
}

impl FraudPolicy {
    /// Sum of all weights (100 for the default policy).
    #[must_use]
    pub fn total_weight(&self) -> u32 {
        self.rules.iter().map(|r| r.weight).sum()
    }

    /// Band of a score.
    #[must_use]
    pub const fn level(&self, score: u8) -> RiskLevel {
        if score >= self.critical_from {
            RiskLevel::Critical
        } else if score >= self.high_from {
            RiskLevel::High
        } else if score >= self.medium_from {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Gating decision for a score.
    #[must_use]
    pub const fn decision(&self, score: u8) -> FraudDecision {
        if score >= self.block_from {
            return FraudDecision::Block;
        }
        match self.level(score) {
            RiskLevel::Critical => FraudDecision::Review,
            RiskLevel::High => FraudDecision::Flag,
            RiskLevel::Medium | RiskLevel::Low => FraudDecision::Allow,
        }
    }

    /// Score `snapshot` for a transaction of `amount`.
    #[must_use]
    pub fn evaluate(
        &self,
        snapshot: &ActivitySnapshot,
        amount: Money,
        ip_known: bool,
        now: DateTime<Utc>,
    ) -> FraudAssessment {
        let signals: Vec<SignalContribution> = self
            .rules
            .iter()
            .map(|rule| {
                let raw = raw_value(rule.signal, snapshot, amount, ip_known, now);
                let factor = raw.map_or(0.0, |value| rule.factor(value));
                SignalContribution {
                    signal: rule.signal,
                    raw,
                    factor,
                    weight: rule.weight,
                    points: factor * f64::from(rule.weight),
                }
            })
            .collect();

        let total: f64 = signals.iter().map(|s| s.points).sum();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let score = total.round().clamp(0.0, 100.0) as u8;
        let decision = self.decision(score);

        FraudAssessment {
            score,
            level: self.level(score),
            decision,
            should_block: decision == FraudDecision::Block,
            signals,
            retry_burst: snapshot.payment_attempts_last_10m >= self.retry_burst_attempts,
            degraded: false,
        }
    }
}

fn raw_value(
    signal: FraudSignal,
    snapshot: &ActivitySnapshot,
    amount: Money,
    ip_known: bool,
    now: DateTime<Utc>,
) -> Option<f64> {
    match signal {
        FraudSignal::Velocity => Some(f64::from(snapshot.bookings_last_hour)),
        FraudSignal::FailureRatio => Some(if snapshot.payments_last_day == 0 {
            0.0
        } else {
            f64::from(snapshot.failed_payments_last_day) / f64::from(snapshot.payments_last_day)
        }),
        FraudSignal::PriceDeviation => snapshot
            .baseline_amount
            .filter(|baseline| baseline.minor() > 0)
            .map(|baseline| {
                #[allow(clippy::cast_precision_loss)]
                let deviation = amount.abs_diff(baseline) as f64 / baseline.minor() as f64;
                deviation
            }),
        #[allow(clippy::cast_precision_loss)]
        FraudSignal::AccountAge => snapshot
            .account_created_at
            .map(|created| (now - created).num_days().max(0) as f64),
        FraudSignal::IpReputation => ip_known.then(|| f64::from(snapshot.users_sharing_ip)),
        FraudSignal::RetryBurst => Some(f64::from(snapshot.payment_attempts_last_10m)),
    }
}

/// Transaction being assessed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FraudContext {
    /// Paying user
    pub user_id: UserId,
    /// Booking being paid, if any
    pub booking_id: Option<BookingId>,
    /// Amount being charged
    pub amount: Money,
    /// Client IP address
    pub ip_address: Option<String>,
}

/// Result of one assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct FraudAssessment {
    /// Score in `[0, 100]`
    pub score: u8,
    /// Risk band
    pub level: RiskLevel,
    /// Gating decision
    pub decision: FraudDecision,
    /// `decision == Block`
    pub should_block: bool,
    /// Per-signal breakdown
    pub signals: Vec<SignalContribution>,
    /// Burst of payment attempts detected
    pub retry_burst: bool,
    /// Activity was unavailable; the assessment failed open
    pub degraded: bool,
}

impl FraudAssessment {
    /// Least restrictive assessment, used when activity cannot be read.
    #[must_use]
    pub const fn fail_open() -> Self {
        Self {
            score: 0,
            level: RiskLevel::Low,
            decision: FraudDecision::Allow,
            should_block: false,
            signals: Vec::new(),
            retry_burst: false,
            degraded: true,
        }
    }
}

/// Scores transactions from recent user activity.
pub struct FraudScorer {
    store: Arc<dyn FraudStore>,
    cache: Arc<dyn Cache>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    policy: FraudPolicy,
}

impl FraudScorer {
    /// Create a scorer.
    #[must_use]
    pub fn new(
        store: Arc<dyn FraudStore>,
        cache: Arc<dyn Cache>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        policy: FraudPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            alerts,
            clock,
            policy,
        }
    }

    /// Assess a transaction. Never fails.
    pub async fn assess(&self, ctx: &FraudContext) -> FraudAssessment {
        let now = self.clock.now();
        let assessment = match self.activity(ctx, now).await {
            Some(snapshot) => {
                self.policy
                    .evaluate(&snapshot, ctx.amount, ctx.ip_address.is_some(), now)
            }
            None => {
                FraudMetrics::record_fail_open();
                FraudAssessment::fail_open()
            }
        };
        FraudMetrics::record_scored(assessment.level);

        let event = FraudEvent {
            user_id: ctx.user_id,
            booking_id: ctx.booking_id,
            ip_address: ctx.ip_address.clone(),
            score: assessment.score,
            level: assessment.level,
            decision: assessment.decision,
            signals: assessment.signals.clone(),
            retry_burst: assessment.retry_burst,
            created_at: now,
        };
        if let Err(error) = self.store.record_fraud_event(&event).await {
            tracing::warn!(user_id = %ctx.user_id, error = %error, "Failed to persist fraud event");
        }

        self.alert(ctx, &assessment);

        tracing::info!(
            user_id = %ctx.user_id,
            score = assessment.score,
            risk_level = %assessment.level,
            decision = %assessment.decision,
            degraded = assessment.degraded,
            "Fraud assessment"
        );
        assessment
    }

    async fn activity(&self, ctx: &FraudContext, now: DateTime<Utc>) -> Option<ActivitySnapshot> {
        let key = format!("fraud:activity:{}", ctx.user_id);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str(&cached) {
                Ok(snapshot) => return Some(snapshot),
                Err(error) => tracing::debug!(key = %key, error = %error, "Discarding unreadable cache entry"),
            },
            Ok(None) => {}
            Err(error) => tracing::debug!(key = %key, error = %error, "Cache read failed"),
        }

        let snapshot = match self
            .store
            .activity_snapshot(ctx.user_id, ctx.ip_address.as_deref(), now)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(user_id = %ctx.user_id, error = %error, "Activity unavailable, failing open");
                return None;
            }
        };

        match serde_json::to_string(&snapshot) {
            Ok(encoded) => {
                if let Err(error) = self.cache.set(&key, encoded, self.policy.snapshot_ttl).await {
                    tracing::debug!(key = %key, error = %error, "Cache write failed");
                }
            }
            Err(error) => tracing::debug!(key = %key, error = %error, "Snapshot not cacheable"),
        }
        Some(snapshot)
    }

    fn alert(&self, ctx: &FraudContext, assessment: &FraudAssessment) {
        let context = json!({
            "user_id": ctx.user_id,
            "booking_id": ctx.booking_id,
            "ip_address": ctx.ip_address,
            "score": assessment.score,
            "decision": assessment.decision,
        });
        match assessment.level {
            RiskLevel::Critical | RiskLevel::High => {
                let severity = if assessment.level == RiskLevel::Critical {
                    Severity::Critical
                } else {
                    Severity::High
                };
                self.alerts.notify(Alert::new(
                    "fraud.high_risk",
                    severity,
                    format!("High fraud risk score {}", assessment.score),
                    context,
                ));
            }
            RiskLevel::Medium | RiskLevel::Low if assessment.retry_burst => {
                self.alerts.notify(Alert::new(
                    "fraud.retry_burst",
                    Severity::Medium,
                    "Payment retry burst detected",
                    context,
                ));
            }
            RiskLevel::Medium | RiskLevel::Low => {}
        }
    }
}
