//! Row decoding shared by the stores.

use crate::error::{narrow, store_error};
use guidepay_core::booking::{Booking, BookingPaymentStatus, BookingStatus};
use guidepay_core::commission::{
    Commission, CommissionRate, CommissionSplit, CommissionStatus,
};
use guidepay_core::error::StoreError;
use guidepay_core::payment::{Payment, PaymentStatus, ProviderPayload};
use guidepay_core::pricing::PriceBreakdown;
use guidepay_core::types::{BookingId, GuideId, Money, PaymentId, TimeWindow, UserId};
use sqlx::Postgres;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

pub(crate) const BOOKING_COLUMNS: &str = "id, user_id, guide_id, start_time, duration_minutes, \
    status, payment_status, hourly_rate, base_amount, peak_surcharge, weekend_surcharge, \
    add_ons_amount, total_amount, payment_intent_id, notes, created_at, updated_at";

pub(crate) const PAYMENT_COLUMNS: &str =
    "id, booking_id, intent_id, amount, currency, status, provider_payload, created_at, updated_at";

pub(crate) const COMMISSION_COLUMNS: &str = "id, booking_id, gross_amount, rate_bps, \
    platform_amount, guide_amount, status, created_at, updated_at, settled_at";

/// Read one column, mapping decode failures.
pub(crate) fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(store_error)
}

pub(crate) fn money(row: &PgRow, name: &str) -> Result<Money, StoreError> {
    col::<i64>(row, name).map(Money::from_minor)
}

pub(crate) fn booking(row: &PgRow) -> Result<Booking, StoreError> {
    let duration_minutes: u32 = narrow(col::<i32>(row, "duration_minutes")?, "duration_minutes")?;
    Ok(Booking {
        id: BookingId::new(col(row, "id")?),
        user_id: UserId::from_uuid(col::<Uuid>(row, "user_id")?),
        guide_id: GuideId::from_uuid(col::<Uuid>(row, "guide_id")?),
        window: TimeWindow::new(col(row, "start_time")?, duration_minutes),
        status: BookingStatus::parse(&col::<String>(row, "status")?)?,
        payment_status: BookingPaymentStatus::parse(&col::<String>(row, "payment_status")?)?,
        price: PriceBreakdown {
            hourly_rate: money(row, "hourly_rate")?,
            duration_minutes,
            base_amount: money(row, "base_amount")?,
            peak_surcharge: money(row, "peak_surcharge")?,
            weekend_surcharge: money(row, "weekend_surcharge")?,
            add_ons_amount: money(row, "add_ons_amount")?,
            total: money(row, "total_amount")?,
        },
        payment_intent_id: col(row, "payment_intent_id")?,
        notes: col(row, "notes")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

pub(crate) fn payment(row: &PgRow) -> Result<Payment, StoreError> {
    Ok(Payment {
        id: PaymentId::new(col(row, "id")?),
        booking_id: BookingId::new(col(row, "booking_id")?),
        intent_id: col(row, "intent_id")?,
        amount: money(row, "amount")?,
        currency: col(row, "currency")?,
        status: PaymentStatus::parse(&col::<String>(row, "status")?)?,
        provider_payload: col::<Option<serde_json::Value>>(row, "provider_payload")?
            .map(ProviderPayload::from_json),
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

pub(crate) fn commission(row: &PgRow) -> Result<Commission, StoreError> {
    let rate_bps: u32 = narrow(col::<i32>(row, "rate_bps")?, "rate_bps")?;
    Ok(Commission {
        id: col(row, "id")?,
        booking_id: BookingId::new(col(row, "booking_id")?),
        split: CommissionSplit {
            gross: money(row, "gross_amount")?,
            rate: CommissionRate::from_bps(rate_bps),
            platform_amount: money(row, "platform_amount")?,
            guide_amount: money(row, "guide_amount")?,
        },
        status: CommissionStatus::parse(&col::<String>(row, "status")?)?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
        settled_at: col(row, "settled_at")?,
    })
}
