//! Guide directory port.
//!
//! Guide and listing management belongs to another service; the booking flow
//! only needs a consistent read of whether a guide can be booked and at what rate.

use crate::BoxFuture;
use crate::types::{GuideId, Money};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The slice of guide state that booking creation depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuideProfile {
    /// Guide identifier
    pub id: GuideId,
    /// Hourly base rate in minor units
    pub hourly_rate: Money,
    /// Account is active (not suspended or deleted)
    pub is_active: bool,
    /// Guide currently accepts bookings
    pub is_available: bool,
}

impl GuideProfile {
    /// Whether a new booking may be placed with this guide.
    #[must_use]
    pub const fn is_bookable(&self) -> bool {
        self.is_active && self.is_available
    }
}

/// Failure reading guide state.
#[derive(Error, Debug, Clone)]
#[error("Guide directory unavailable: {0}")]
pub struct DirectoryError(pub String);

/// Read access to guide state.
pub trait GuideDirectory: Send + Sync {
    /// Look up a guide by id.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if the directory cannot be reached.
    fn find_guide(&self, id: GuideId) -> BoxFuture<'_, Result<Option<GuideProfile>, DirectoryError>>;
}
