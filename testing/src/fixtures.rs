//! Canned records for tests.
//!
//! Times are anchored to [`test_clock`](crate::test_clock) (2025-01-01), so
//! every slot below lies in the future from the clock's point of view.

#![allow(clippy::missing_panics_doc)]
#![allow(clippy::unwrap_used)]

use chrono::{DateTime, TimeZone, Utc};
use guidepay_core::environment::Clock;
use guidepay_core::booking::{Booking, BookingPaymentStatus, BookingStatus, NewBooking};
use guidepay_core::guide::GuideProfile;
use guidepay_core::payment::{NewPayment, Payment, PaymentStatus};
use guidepay_core::pricing::PriceBreakdown;
use guidepay_core::types::{BookingId, GuideId, Money, PaymentId, TimeWindow, UserId};

/// Lower bound that includes every fixture row.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Tuesday 2025-03-04 10:00 UTC (weekday, off-peak).
#[must_use]
pub fn weekday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap()
}

/// Saturday 2025-03-08 19:00 UTC (weekend, peak).
#[must_use]
pub fn saturday_evening() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 8, 19, 0, 0).unwrap()
}

/// Active, available guide with the given hourly rate.
#[must_use]
pub fn guide(hourly_rate: i64) -> GuideProfile {
    GuideProfile {
        id: GuideId::new(),
        hourly_rate: Money::from_minor(hourly_rate),
        is_active: true,
        is_available: true,
    }
}

/// Flat breakdown whose total is `total`.
#[must_use]
pub fn flat_price(total: i64, duration_minutes: u32) -> PriceBreakdown {
    PriceBreakdown {
        hourly_rate: Money::from_minor(total),
        duration_minutes,
        base_amount: Money::from_minor(total),
        peak_surcharge: Money::ZERO,
        weekend_surcharge: Money::ZERO,
        add_ons_amount: Money::ZERO,
        total: Money::from_minor(total),
    }
}

/// Insert values for a booking of a random user with a random guide.
#[must_use]
pub fn new_booking(start: DateTime<Utc>, duration_minutes: u32) -> NewBooking {
    NewBooking {
        user_id: UserId::new(),
        guide_id: GuideId::new(),
        window: TimeWindow::new(start, duration_minutes),
        price: flat_price(2000, duration_minutes),
        notes: None,
        created_at: crate::test_clock().now(),
    }
}

/// Pending, unpaid booking row.
#[must_use]
pub fn booking_row(id: i64, total: i64) -> Booking {
    NewBooking {
        price: flat_price(total, 120),
        ..new_booking(weekday_morning(), 120)
    }
    .into_booking(BookingId::new(id))
}

/// Booking row marked confirmed and paid through `intent_id`.
#[must_use]
pub fn paid_booking_row(id: i64, total: i64, intent_id: &str) -> Booking {
    Booking {
        status: BookingStatus::Confirmed,
        payment_status: BookingPaymentStatus::Paid,
        payment_intent_id: Some(intent_id.to_string()),
        ..booking_row(id, total)
    }
}

/// Insert values for an `initiated` payment.
#[must_use]
pub fn new_payment(booking_id: BookingId, intent_id: &str, amount: i64) -> NewPayment {
    NewPayment {
        booking_id,
        intent_id: intent_id.to_string(),
        amount: Money::from_minor(amount),
        currency: "usd".to_string(),
        status: PaymentStatus::Initiated,
        provider_payload: None,
        created_at: crate::test_clock().now(),
    }
}

/// Succeeded payment row.
#[must_use]
pub fn payment_row(id: i64, booking_id: i64, intent_id: &str, amount: i64) -> Payment {
    NewPayment {
        status: PaymentStatus::Succeeded,
        ..new_payment(BookingId::new(booking_id), intent_id, amount)
    }
    .into_payment(PaymentId::new(id))
}
