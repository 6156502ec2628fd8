//! Ephemeral key/value cache port.
//!
//! The cache is advisory: a miss, an eviction or an outright failure may only
//! cost latency, never correctness.

use crate::BoxFuture;
use std::time::Duration;
use thiserror::Error;

/// Cache backend failure.
#[derive(Error, Debug, Clone)]
#[error("Cache error: {0}")]
pub struct CacheError(pub String);

/// String key/value cache with per-entry TTL.
pub trait Cache: Send + Sync {
    /// Read a live entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend cannot be reached.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>>;

    /// Write an entry that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend cannot be reached.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}
