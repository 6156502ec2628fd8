//! Error taxonomy shared by every component.
//!
//! Every service-level error maps onto one [`ErrorKind`], which decides who retries:
//!
//! - **Validation / `NotFound`**: the caller's fault, never retried
//! - **Conflict**: overlapping slot, already-paid booking, illegal transition
//! - **Transient**: lock contention, provider timeout; safe to retry
//! - **Permanent**: the provider rejected the request outright
//! - **Internal**: retries exhausted or stored data unreadable
//!
//! Data-integrity anomalies are not errors; they are detected asynchronously by
//! reconciliation and recorded as findings.

use thiserror::Error;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller supplied invalid input
    Validation,
    /// Referenced entity does not exist
    NotFound,
    /// Request conflicts with current state
    Conflict,
    /// Infrastructure hiccup; retrying may succeed
    Transient,
    /// Infrastructure refused the request; retrying will not help
    Permanent,
    /// Unrecoverable failure inside the core (exhausted retries, corrupt data)
    Internal,
}

impl ErrorKind {
    /// HTTP status an upstream controller should answer with.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Transient => 503,
            Self::Permanent => 502,
            Self::Internal => 500,
        }
    }

    /// Whether the caller should retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Errors raised by the relational store adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Lock wait timeout, deadlock, serialization failure or pool exhaustion.
    #[error("Transient database error: {0}")]
    Transient(String),

    /// Unique or exclusion constraint violated.
    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// Stored data could not be decoded into a domain type.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether retrying the whole transaction may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classification for propagation.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Constraint(_) => ErrorKind::Conflict,
            Self::Decode(_) | Self::Database(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_store_errors_retry() {
        assert!(StoreError::Transient("deadlock".into()).is_retryable());
        assert!(!StoreError::Constraint("dup".into()).is_retryable());
        assert!(!StoreError::Database("syntax".into()).is_retryable());
        assert!(!StoreError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn kinds_map_to_http_statuses() {
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::Transient.http_status(), 503);
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
    }
}
