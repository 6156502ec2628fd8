//! # Guidepay Engine
//!
//! The transactional components of the guidepay core, written against the
//! ports of `guidepay-core`:
//!
//! - [`booking::BookingService`]: conflict-checked atomic booking creation and
//!   administrative status changes
//! - [`intent::IntentManager`]: at most one active provider intent per booking
//! - [`webhook::WebhookProcessor`]: signed provider callbacks applied exactly once
//! - [`fraud::FraudScorer`]: fail-open weighted risk score
//! - [`reconciliation::ReconciliationEngine`]: resumable, report-only ledger audit
//!
//! Ledger-bound services are generic over [`LedgerStore`](guidepay_core::store::LedgerStore)
//! because its transactions are an associated type; the rest take `Arc<dyn …>` ports.
//!
//! ## Example
//!
//! ```ignore
//! let bookings = BookingService::new(store.clone(), directory, pricing, clock.clone(), BookingConfig::default());
//! let booking = bookings.create(request).await?;
//!
//! let intents = IntentManager::new(store, provider, clock, IntentConfig::default());
//! let intent = intents.create_or_reuse(booking.id).await?;
//! ```

pub mod booking;
pub mod config;
pub mod fraud;
pub mod intent;
pub mod reconciliation;
pub mod side_effects;
pub mod signature;
pub mod webhook;

pub use booking::{BookingError, BookingService, CreateBookingRequest};
pub use config::{BookingConfig, IntentConfig, ReconciliationConfig, WebhookConfig};
pub use fraud::{FraudAssessment, FraudContext, FraudPolicy, FraudScorer};
pub use intent::{IntentError, IntentManager, IntentResult};
pub use reconciliation::{
    ReconciliationEngine, ReconciliationError, ReconciliationParams, ReconciliationReport,
};
pub use signature::SignatureError;
pub use webhook::{NoOpReason, WebhookError, WebhookOutcome, WebhookProcessor};
