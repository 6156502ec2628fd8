//! Payment record: one provider charge intent mapped onto a booking.
//!
//! ```text
//! initiated ──► processing ──► succeeded
//!     │              │
//!     │              └──────► failed
//!     └──► cancelled / failed
//! ```
//!
//! At most one payment per booking may be *active* (`initiated` or `processing`)
//! at any time.

use crate::provider::ProviderIntent;
use crate::types::{BookingId, Money, PaymentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

text_enum! {
    /// Lifecycle status of a payment.
    pub enum PaymentStatus {
        /// Intent created, awaiting customer action
        Initiated => "initiated",
        /// Provider is processing the charge
        Processing => "processing",
        /// Funds captured
        Succeeded => "succeeded",
        /// Charge failed
        Failed => "failed",
        /// Intent cancelled
        Cancelled => "cancelled",
    }
}

impl PaymentStatus {
    /// Non-terminal status still eligible to reach success.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Initiated | Self::Processing)
    }

    /// Terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// Snapshot of a provider webhook event kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSnapshot {
    /// Provider event id
    pub event_id: String,
    /// Provider event type (`payment_intent.succeeded`, ...)
    pub event_type: String,
    /// When the event was received
    pub received_at: DateTime<Utc>,
    /// The event's data object, verbatim
    pub object: serde_json::Value,
}

/// Last provider payload stored with a payment.
///
/// Decoded only for audit and reconciliation; control flow never branches on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ProviderPayload {
    /// Intent as returned by create/retrieve
    Intent(ProviderIntent),
    /// Webhook event that last touched the payment
    Webhook(WebhookSnapshot),
    /// Anything else, kept verbatim
    Raw(serde_json::Value),
}

impl ProviderPayload {
    /// Decode a stored JSON column, falling back to [`ProviderPayload::Raw`].
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or(Self::Raw(value))
    }

    /// Encode for storage.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A persisted payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Row id
    pub id: PaymentId,
    /// Booking being paid
    pub booking_id: BookingId,
    /// Provider intent id
    pub intent_id: String,
    /// Charged amount in minor units
    pub amount: Money,
    /// Lowercase ISO currency code
    pub currency: String,
    /// Lifecycle status
    pub status: PaymentStatus,
    /// Last provider payload
    pub provider_payload: Option<ProviderPayload>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

/// Values for inserting a new payment row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    /// Booking being paid
    pub booking_id: BookingId,
    /// Provider intent id
    pub intent_id: String,
    /// Charged amount
    pub amount: Money,
    /// Currency code
    pub currency: String,
    /// Initial status, mapped from the provider
    pub status: PaymentStatus,
    /// Provider response that created the row
    pub provider_payload: Option<ProviderPayload>,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

impl NewPayment {
    /// Materialise the row as the store would insert it.
    #[must_use]
    pub fn into_payment(self, id: PaymentId) -> Payment {
        Payment {
            id,
            booking_id: self.booking_id,
            intent_id: self.intent_id,
            amount: self.amount,
            currency: self.currency,
            status: self.status,
            provider_payload: self.provider_payload,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}
