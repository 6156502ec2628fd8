//! Booking record and its status lifecycle.
//!
//! # Status DAG
//!
//! ```text
//! pending ──► confirmed ──► completed
//!    │            │
//!    └──► cancelled ◄┘
//! ```
//!
//! `completed` and `cancelled` are terminal. A booking is created `pending` by the
//! creation flow and moves to `confirmed` only through a succeeded payment
//! webhook or the administrative transition path.

use crate::pricing::PriceBreakdown;
use crate::types::{BookingId, GuideId, Money, TimeWindow, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

text_enum! {
    /// Lifecycle status of a booking.
    pub enum BookingStatus {
        /// Created, awaiting payment
        Pending => "pending",
        /// Paid and scheduled
        Confirmed => "confirmed",
        /// Service delivered
        Completed => "completed",
        /// Called off
        Cancelled => "cancelled",
    }
}

impl BookingStatus {
    /// Statuses reachable in one step from `self`.
    #[must_use]
    pub const fn allowed_transitions(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Confirmed, Self::Cancelled],
            Self::Confirmed => &[Self::Completed, Self::Cancelled],
            Self::Completed | Self::Cancelled => &[],
        }
    }

    /// Whether `self → target` is an edge of the status DAG.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// No further transitions possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether a booking in this status holds its time slot.
    #[must_use]
    pub const fn occupies_slot(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::Completed)
    }
}

text_enum! {
    /// Payment progress as seen from the booking.
    pub enum BookingPaymentStatus {
        /// No intent requested yet
        Unpaid => "unpaid",
        /// An intent exists and awaits confirmation
        RequiresPayment => "requires_payment",
        /// A payment for this booking succeeded
        Paid => "paid",
        /// The last payment attempt failed
        Failed => "failed",
    }
}

/// Attempted status change that is not an edge of the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// Current status
    pub from: BookingStatus,
    /// Requested status
    pub to: BookingStatus,
}

impl InvalidTransition {
    /// Statuses that would have been accepted.
    #[must_use]
    pub const fn allowed(&self) -> &'static [BookingStatus] {
        self.from.allowed_transitions()
    }
}

/// A persisted booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Row id
    pub id: BookingId,
    /// Customer
    pub user_id: UserId,
    /// Guide being booked
    pub guide_id: GuideId,
    /// Booked slot
    pub window: TimeWindow,
    /// Lifecycle status
    pub status: BookingStatus,
    /// Payment progress
    pub payment_status: BookingPaymentStatus,
    /// Price breakdown computed at creation
    pub price: PriceBreakdown,
    /// Latest provider intent id for this booking
    pub payment_intent_id: Option<String>,
    /// Free-form customer notes
    pub notes: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Amount charged for this booking.
    #[must_use]
    pub const fn total(&self) -> Money {
        self.price.total
    }

    /// Move along the status DAG.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if `target` is not reachable from the current status.
    pub fn transition_to(
        &mut self,
        target: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition {
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Record that a payment for this booking succeeded and confirm it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the booking can no longer be confirmed.
    pub fn confirm_paid(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition_to(BookingStatus::Confirmed, now)?;
        self.payment_status = BookingPaymentStatus::Paid;
        Ok(())
    }
}

/// Values for inserting a new booking row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    /// Customer
    pub user_id: UserId,
    /// Guide being booked
    pub guide_id: GuideId,
    /// Requested slot
    pub window: TimeWindow,
    /// Computed price
    pub price: PriceBreakdown,
    /// Customer notes
    pub notes: Option<String>,
    /// Insertion time
    pub created_at: DateTime<Utc>,
}

impl NewBooking {
    /// Materialise the row as the store would insert it.
    #[must_use]
    pub fn into_booking(self, id: BookingId) -> Booking {
        Booking {
            id,
            user_id: self.user_id,
            guide_id: self.guide_id,
            window: self.window,
            status: BookingStatus::Pending,
            payment_status: BookingPaymentStatus::Unpaid,
            price: self.price,
            payment_intent_id: None,
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}
