//! Revenue split between the platform and the guide.
//!
//! The split is a pure function of the gross amount and the platform rate, so
//! recomputing it after a redelivered webhook always yields the same figures.

use crate::types::{BookingId, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform commission rate in basis points (1_500 = 15%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommissionRate(u32);

impl CommissionRate {
    /// Create from basis points, capped at 100%.
    #[must_use]
    pub const fn from_bps(bps: u32) -> Self {
        if bps > 10_000 { Self(10_000) } else { Self(bps) }
    }

    /// Rate in basis points.
    #[must_use]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Rate as a fraction, for display and reporting.
    #[must_use]
    pub fn as_fraction(&self) -> f64 {
        f64::from(self.0) / 10_000.0
    }
}

impl Default for CommissionRate {
    fn default() -> Self {
        Self(1_500)
    }
}

/// Deterministic platform/guide split of a gross amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    /// Amount paid by the customer
    pub gross: Money,
    /// Platform rate applied
    pub rate: CommissionRate,
    /// `round(gross × rate)`
    pub platform_amount: Money,
    /// `gross − platform_amount`
    pub guide_amount: Money,
}

impl CommissionSplit {
    /// Compute the split. `platform_amount + guide_amount == gross` always holds.
    #[must_use]
    pub fn compute(gross: Money, rate: CommissionRate) -> Self {
        let platform_amount = gross.scale_bps(rate.bps());
        Self {
            gross,
            rate,
            platform_amount,
            guide_amount: gross - platform_amount,
        }
    }
}

text_enum! {
    /// Settlement status of a commission.
    pub enum CommissionStatus {
        /// Computed, not yet settled
        Pending => "pending",
        /// Payment captured; split is final
        Settled => "settled",
    }
}

/// A persisted commission row (unique per booking).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    /// Row id, stable across upserts
    pub id: i64,
    /// Booking this split belongs to
    pub booking_id: BookingId,
    /// Split figures
    pub split: CommissionSplit,
    /// Settlement status
    pub status: CommissionStatus,
    /// First insertion
    pub created_at: DateTime<Utc>,
    /// Last upsert
    pub updated_at: DateTime<Utc>,
    /// When the split became final
    pub settled_at: Option<DateTime<Utc>>,
}

/// Values for upserting a commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionUpsert {
    /// Booking the split belongs to
    pub booking_id: BookingId,
    /// Recomputed split
    pub split: CommissionSplit,
    /// Target status
    pub status: CommissionStatus,
    /// Upsert time
    pub at: DateTime<Utc>,
}

impl CommissionUpsert {
    /// Apply this upsert on top of an existing row, or create a fresh one.
    ///
    /// Identity (`id`, `created_at`) and the original `settled_at` survive.
    #[must_use]
    pub fn apply(self, existing: Option<&Commission>, new_id: i64) -> Commission {
        let settled_at = match (existing.and_then(|c| c.settled_at), self.status) {
            (Some(at), _) => Some(at),
            (None, CommissionStatus::Settled) => Some(self.at),
            (None, CommissionStatus::Pending) => None,
        };
        let status = match existing.map(|c| c.status) {
            Some(CommissionStatus::Settled) => CommissionStatus::Settled,
            _ => self.status,
        };
        Commission {
            id: existing.map_or(new_id, |c| c.id),
            booking_id: self.booking_id,
            split: self.split,
            status,
            created_at: existing.map_or(self.at, |c| c.created_at),
            updated_at: self.at,
            settled_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn split_of_2000_at_15_percent() {
        let split = CommissionSplit::compute(Money::from_minor(2000), CommissionRate::from_bps(1_500));
        assert_eq!(split.platform_amount, Money::from_minor(300));
        assert_eq!(split.guide_amount, Money::from_minor(1700));
    }

    #[test]
    fn rate_is_capped() {
        assert_eq!(CommissionRate::from_bps(20_000).bps(), 10_000);
    }

    #[test]
    fn reapplying_keeps_identity_and_settlement() {
        let first_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let split = CommissionSplit::compute(Money::from_minor(2000), CommissionRate::default());
        let upsert = CommissionUpsert {
            booking_id: BookingId::new(1),
            split,
            status: CommissionStatus::Settled,
            at: first_at,
        };
        let first = upsert.apply(None, 10);

        let again = CommissionUpsert { at: later, ..upsert }.apply(Some(&first), 11);
        assert_eq!(again.id, 10);
        assert_eq!(again.created_at, first_at);
        assert_eq!(again.settled_at, Some(first_at));
        assert_eq!(again.split, first.split);

        let downgrade = CommissionUpsert {
            status: CommissionStatus::Pending,
            at: later,
            ..upsert
        }
        .apply(Some(&first), 12);
        assert_eq!(downgrade.status, CommissionStatus::Settled);
    }

    proptest! {
        #[test]
        fn split_is_deterministic_and_conserves_gross(gross in 0i64..10_000_000_000, bps in 0u32..=10_000) {
            let rate = CommissionRate::from_bps(bps);
            let a = CommissionSplit::compute(Money::from_minor(gross), rate);
            let b = CommissionSplit::compute(Money::from_minor(gross), rate);
            prop_assert_eq!(a, b);
            prop_assert_eq!(a.platform_amount + a.guide_amount, a.gross);
            prop_assert!(a.platform_amount.minor() >= 0);
            prop_assert!(a.platform_amount <= a.gross);
        }
    }
}
