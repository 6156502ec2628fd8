//! Price computation collaborator.
//!
//! Pricing is deterministic: the same guide rate, window and add-ons always
//! produce the same [`PriceBreakdown`]. The breakdown is stored with the booking
//! so later rate changes never alter an existing booking's total.

use crate::guide::GuideProfile;
use crate::types::{Money, TimeWindow};
use chrono::{Datelike, Timelike, Weekday};
use serde::{Deserialize, Serialize};

/// Optional extra purchased with a booking (equipment, transport, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOn {
    /// Catalog code
    pub code: String,
    /// Flat price in minor units
    pub price: Money,
}

/// Itemised price of a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    /// Guide hourly rate at booking time
    pub hourly_rate: Money,
    /// Booked minutes
    pub duration_minutes: u32,
    /// `hourly_rate` × hours
    pub base_amount: Money,
    /// Evening surcharge
    pub peak_surcharge: Money,
    /// Saturday/Sunday surcharge
    pub weekend_surcharge: Money,
    /// Sum of add-on prices
    pub add_ons_amount: Money,
    /// Amount charged to the customer
    pub total: Money,
}

/// Computes a price breakdown for a requested slot.
pub trait Pricing: Send + Sync {
    /// Quote a slot with a guide.
    fn quote(&self, guide: &GuideProfile, window: &TimeWindow, add_ons: &[AddOn]) -> PriceBreakdown;
}

/// Rate-card pricing: base rate per hour, evening and weekend multipliers, flat add-ons.
#[derive(Debug, Clone)]
pub struct RateCardPricing {
    /// First hour (UTC, inclusive) of the evening peak
    pub peak_start_hour: u32,
    /// Last hour (UTC, exclusive) of the evening peak
    pub peak_end_hour: u32,
    /// Peak multiplier in basis points (12_500 = ×1.25)
    pub peak_multiplier_bps: u32,
    /// Weekend multiplier in basis points (11_000 = ×1.10)
    pub weekend_multiplier_bps: u32,
}

impl Default for RateCardPricing {
    fn default() -> Self {
        Self {
            peak_start_hour: 18,
            peak_end_hour: 22,
            peak_multiplier_bps: 12_500,
            weekend_multiplier_bps: 11_000,
        }
    }
}

impl RateCardPricing {
    fn is_peak(&self, window: &TimeWindow) -> bool {
        let hour = window.start.hour();
        hour >= self.peak_start_hour && hour < self.peak_end_hour
    }

    fn is_weekend(window: &TimeWindow) -> bool {
        matches!(window.start.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

impl Pricing for RateCardPricing {
    fn quote(&self, guide: &GuideProfile, window: &TimeWindow, add_ons: &[AddOn]) -> PriceBreakdown {
        // rate × minutes / 60, rounded half up
        let base_minor = (guide.hourly_rate.minor() * i64::from(window.duration_minutes) + 30) / 60;
        let base_amount = Money::from_minor(base_minor);

        let peak_surcharge = if self.is_peak(window) {
            base_amount.scale_bps(self.peak_multiplier_bps.saturating_sub(10_000))
        } else {
            Money::ZERO
        };
        let weekend_surcharge = if Self::is_weekend(window) {
            base_amount.scale_bps(self.weekend_multiplier_bps.saturating_sub(10_000))
        } else {
            Money::ZERO
        };
        let add_ons_amount: Money = add_ons.iter().map(|a| a.price).sum();

        PriceBreakdown {
            hourly_rate: guide.hourly_rate,
            duration_minutes: window.duration_minutes,
            base_amount,
            peak_surcharge,
            weekend_surcharge,
            add_ons_amount,
            total: base_amount + peak_surcharge + weekend_surcharge + add_ons_amount,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::GuideId;
    use chrono::{TimeZone, Utc};

    fn guide(rate: i64) -> GuideProfile {
        GuideProfile {
            id: GuideId::new(),
            hourly_rate: Money::from_minor(rate),
            is_active: true,
            is_available: true,
        }
    }

    #[test]
    fn off_peak_weekday_is_rate_times_hours() {
        // 2025-03-04 is a Tuesday
        let window = TimeWindow::new(Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap(), 120);
        let quote = RateCardPricing::default().quote(&guide(1000), &window, &[]);
        assert_eq!(quote.total, Money::from_minor(2000));
        assert_eq!(quote.peak_surcharge, Money::ZERO);
        assert_eq!(quote.weekend_surcharge, Money::ZERO);
    }

    #[test]
    fn evening_weekend_stacks_surcharges_and_add_ons() {
        // 2025-03-08 is a Saturday
        let window = TimeWindow::new(Utc.with_ymd_and_hms(2025, 3, 8, 19, 0, 0).unwrap(), 60);
        let add_ons = vec![AddOn {
            code: "gear".into(),
            price: Money::from_minor(150),
        }];
        let quote = RateCardPricing::default().quote(&guide(1000), &window, &add_ons);
        assert_eq!(quote.base_amount, Money::from_minor(1000));
        assert_eq!(quote.peak_surcharge, Money::from_minor(250));
        assert_eq!(quote.weekend_surcharge, Money::from_minor(100));
        assert_eq!(quote.total, Money::from_minor(1500));
    }

    #[test]
    fn partial_hours_are_prorated() {
        let window = TimeWindow::new(Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap(), 90);
        let quote = RateCardPricing::default().quote(&guide(1000), &window, &[]);
        assert_eq!(quote.total, Money::from_minor(1500));
    }
}
