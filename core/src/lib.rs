//! # Guidepay Core
//!
//! Domain types and port traits for the transactional core of a
//! booking-and-payment marketplace.
//!
//! This crate has no I/O of its own. It defines:
//!
//! - **Records**: [`booking::Booking`], [`payment::Payment`], [`commission::Commission`],
//!   [`reconciliation::ReconciliationFinding`], [`fraud::FraudEvent`]
//! - **Error taxonomy**: [`error::ErrorKind`] and [`error::StoreError`]
//! - **Ports**: the relational store ([`store`]), payment provider ([`provider`]),
//!   durable job queue ([`queue`]), ephemeral cache ([`cache`]), alert sink ([`alert`]),
//!   guide directory ([`guide`]) and clock ([`environment`])
//!
//! Adapters live in `guidepay-postgres` (production) and `guidepay-testing`
//! (in-memory). The algorithms that drive these ports live in `guidepay-engine`.

use std::future::Future;
use std::pin::Pin;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Boxed, `Send` future returned by the dyn-compatible ports.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[macro_use]
mod macros;

pub mod alert;
pub mod booking;
pub mod cache;
pub mod commission;
pub mod environment;
pub mod error;
pub mod fraud;
pub mod guide;
pub mod payment;
pub mod pricing;
pub mod provider;
pub mod queue;
pub mod reconciliation;
pub mod store;
pub mod types;

pub use error::{ErrorKind, StoreError};
pub use types::{BookingId, GuideId, Money, PaymentId, RunId, TimeWindow, UserId};
