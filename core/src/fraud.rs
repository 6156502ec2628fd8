//! Fraud risk records.

use crate::types::{BookingId, Money, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

text_enum! {
    /// Risk band of a score.
    pub enum RiskLevel {
        /// 0–29
        Low => "low",
        /// 30–59
        Medium => "medium",
        /// 60–79
        High => "high",
        /// 80–100
        Critical => "critical",
    }
}

text_enum! {
    /// Gating decision derived from a score.
    pub enum FraudDecision {
        /// Proceed
        Allow => "allow",
        /// Proceed, mark for later review
        Flag => "flag",
        /// Hold for manual review
        Review => "review",
        /// Refuse the transaction
        Block => "block",
    }
}

text_enum! {
    /// Behavioural signal feeding the score.
    pub enum FraudSignal {
        /// Bookings placed in the last hour
        Velocity => "velocity",
        /// Failed share of recent payments
        FailureRatio => "failure_ratio",
        /// Relative distance from the user's usual amount
        PriceDeviation => "price_deviation",
        /// Days since account creation
        AccountAge => "account_age",
        /// Other accounts seen from the same IP
        IpReputation => "ip_reputation",
        /// Payment attempts in a short burst
        RetryBurst => "retry_burst",
    }
}

/// Contribution of one signal to the score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    /// Which signal
    pub signal: FraudSignal,
    /// Raw metric value; `None` when the input is unknown
    pub raw: Option<f64>,
    /// Step-function output in `[0, 1]`
    pub factor: f64,
    /// Policy weight
    pub weight: u32,
    /// `factor × weight`
    pub points: f64,
}

/// Recent user activity that the scorer reads, possibly from cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    /// Bookings created by the user in the last hour
    pub bookings_last_hour: u32,
    /// Payments created for the user's bookings in the last 24 hours
    pub payments_last_day: u32,
    /// Of those, how many failed
    pub failed_payments_last_day: u32,
    /// Payment attempts in the last 10 minutes
    pub payment_attempts_last_10m: u32,
    /// Average booking total over the last 90 days
    pub baseline_amount: Option<Money>,
    /// Account creation time, if known
    pub account_created_at: Option<DateTime<Utc>>,
    /// Distinct other users recently seen from the same IP
    pub users_sharing_ip: u32,
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
}

/// Write-once audit record of one assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudEvent {
    /// Assessed user
    pub user_id: UserId,
    /// Booking under assessment, if any
    pub booking_id: Option<BookingId>,
    /// Client IP address
    pub ip_address: Option<String>,
    /// Score in `[0, 100]`
    pub score: u8,
    /// Risk band
    pub level: RiskLevel,
    /// Gating decision
    pub decision: FraudDecision,
    /// Per-signal breakdown
    pub signals: Vec<SignalContribution>,
    /// A retry burst was detected
    pub retry_burst: bool,
    /// Assessment time
    pub created_at: DateTime<Utc>,
}
