//! Payment provider port.
//!
//! Abstraction over a card processor with a Stripe-like intent model:
//! the core creates a charge intent per booking, the client confirms it directly
//! with the provider, and the provider reports the outcome through signed webhooks.

use crate::BoxFuture;
use crate::payment::PaymentStatus;
use crate::types::Money;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Intent status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderIntentStatus {
    /// Awaiting a payment method
    RequiresPaymentMethod,
    /// Awaiting client confirmation
    RequiresConfirmation,
    /// Awaiting 3-D Secure or similar
    RequiresAction,
    /// Authorised, awaiting capture
    RequiresCapture,
    /// Being processed
    Processing,
    /// Funds captured
    Succeeded,
    /// Cancelled before completion
    Canceled,
}

impl ProviderIntentStatus {
    /// Internal payment status this provider status corresponds to.
    #[must_use]
    pub const fn to_payment_status(&self) -> PaymentStatus {
        match self {
            Self::RequiresPaymentMethod
            | Self::RequiresConfirmation
            | Self::RequiresAction
            | Self::RequiresCapture => PaymentStatus::Initiated,
            Self::Processing => PaymentStatus::Processing,
            Self::Succeeded => PaymentStatus::Succeeded,
            Self::Canceled => PaymentStatus::Cancelled,
        }
    }

    /// Whether a local payment in `local` status is consistent with this
    /// provider status.
    ///
    /// The provider has no failed state: a declined charge drops back to a
    /// `requires_*` state, so a locally failed payment agrees with any of them.
    #[must_use]
    pub const fn agrees_with(&self, local: PaymentStatus) -> bool {
        match local {
            PaymentStatus::Failed => matches!(
                self,
                Self::RequiresPaymentMethod
                    | Self::RequiresConfirmation
                    | Self::RequiresAction
                    | Self::RequiresCapture
            ),
            PaymentStatus::Initiated => matches!(self.to_payment_status(), PaymentStatus::Initiated),
            PaymentStatus::Processing => matches!(self, Self::Processing),
            PaymentStatus::Succeeded => matches!(self, Self::Succeeded),
            PaymentStatus::Cancelled => matches!(self, Self::Canceled),
        }
    }
}

/// A charge intent as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIntent {
    /// Provider-side intent id
    pub id: String,
    /// Provider status
    pub status: ProviderIntentStatus,
    /// Amount in minor units
    pub amount: Money,
    /// Lowercase ISO currency code
    pub currency: String,
    /// Secret the client uses to confirm the intent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Metadata echoed back by the provider
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Parameters for creating a charge intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIntentRequest {
    /// Amount in minor units
    pub amount: Money,
    /// Lowercase ISO currency code
    pub currency: String,
    /// Metadata attached to the intent
    pub metadata: BTreeMap<String, String>,
    /// Provider-side deduplication key
    pub idempotency_key: String,
}

/// Payment provider failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Request did not complete within the configured timeout
    #[error("Payment provider timed out")]
    Timeout,

    /// Provider unreachable or returned a 5xx / rate-limit response
    #[error("Payment provider unavailable: {0}")]
    Unavailable(String),

    /// Provider refused the request (4xx)
    #[error("Payment provider rejected request: {0}")]
    Rejected(String),

    /// Intent does not exist on the provider side
    #[error("Intent not found: {0}")]
    NotFound(String),

    /// Response body could not be decoded
    #[error("Invalid provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

/// Payment provider operations used by the core.
///
/// Uses explicit `BoxFuture` returns so implementations can be shared as
/// `Arc<dyn PaymentProvider>`.
pub trait PaymentProvider: Send + Sync {
    /// Create a charge intent.
    ///
    /// Repeating a call with the same `idempotency_key` must return the intent
    /// created by the first call.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on timeout, unavailability or rejection.
    fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> BoxFuture<'_, Result<ProviderIntent, ProviderError>>;

    /// Fetch the current state of an intent.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on timeout, unavailability or unknown intent.
    fn retrieve_intent<'a>(
        &'a self,
        intent_id: &'a str,
    ) -> BoxFuture<'a, Result<ProviderIntent, ProviderError>>;
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn requires_states_map_to_initiated() {
        for status in [
            ProviderIntentStatus::RequiresPaymentMethod,
            ProviderIntentStatus::RequiresConfirmation,
            ProviderIntentStatus::RequiresAction,
            ProviderIntentStatus::RequiresCapture,
        ] {
            assert_eq!(status.to_payment_status(), PaymentStatus::Initiated);
        }
        assert_eq!(
            ProviderIntentStatus::Canceled.to_payment_status(),
            PaymentStatus::Cancelled
        );
    }

    #[test]
    fn failed_payment_agrees_with_requires_states_only() {
        assert!(ProviderIntentStatus::RequiresPaymentMethod.agrees_with(PaymentStatus::Failed));
        assert!(ProviderIntentStatus::RequiresAction.agrees_with(PaymentStatus::Failed));
        assert!(!ProviderIntentStatus::Succeeded.agrees_with(PaymentStatus::Failed));
        assert!(!ProviderIntentStatus::Processing.agrees_with(PaymentStatus::Failed));
        assert!(ProviderIntentStatus::Canceled.agrees_with(PaymentStatus::Cancelled));
        assert!(!ProviderIntentStatus::Succeeded.agrees_with(PaymentStatus::Processing));
        assert!(ProviderIntentStatus::RequiresCapture.agrees_with(PaymentStatus::Initiated));
    }

    #[test]
    fn intent_decodes_from_provider_json() {
        let json = serde_json::json!({
            "id": "pi_123",
            "status": "requires_payment_method",
            "amount": 2000,
            "currency": "usd",
            "client_secret": "pi_123_secret",
            "metadata": { "booking_id": "7" }
        });
        let intent: ProviderIntent = serde_json::from_value(json).expect("fixture should decode");
        assert_eq!(intent.amount, Money::from_minor(2000));
        assert_eq!(intent.metadata.get("booking_id").map(String::as_str), Some("7"));
    }

    #[test]
    fn only_timeouts_and_outages_are_retryable() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Unavailable("503".into()).is_retryable());
        assert!(!ProviderError::Rejected("card".into()).is_retryable());
        assert!(!ProviderError::NotFound("pi".into()).is_retryable());
    }
}
