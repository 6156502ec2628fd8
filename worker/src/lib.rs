//! # Guidepay Worker
//!
//! Background process of the guidepay core:
//!
//! - [`config`]: environment configuration
//! - [`provider`] / [`directory`]: HTTP clients for the payment provider and
//!   the listing service
//! - [`services`]: composition root for the engine components
//! - [`jobs`]: side-effect queue handlers and the consumer loop
//! - [`scheduler`]: periodic reconciliation runs
//!
//! The binary in `main.rs` wires these together with tracing, the metrics
//! exporter and graceful shutdown.

pub mod config;
pub mod directory;
pub mod jobs;
pub mod provider;
pub mod scheduler;
pub mod services;

pub use config::Config;
pub use services::Services;
