//! Mapping of `sqlx` failures onto [`StoreError`].

use guidepay_core::error::StoreError;

/// SQLSTATE codes that a retry of the whole transaction may clear.
const RETRYABLE_SQLSTATES: &[&str] = &[
    // serialization_failure
    "40001",
    // deadlock_detected
    "40P01",
    // lock_not_available (raised when lock_timeout expires)
    "55P03",
    // query_canceled (statement_timeout)
    "57014",
];

/// SQLSTATE codes of unique and exclusion violations.
const CONSTRAINT_SQLSTATES: &[&str] = &["23505", "23P01"];

/// Classify a `sqlx` error.
pub(crate) fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::Transient("connection pool timed out".to_string()),
        sqlx::Error::Io(e) => StoreError::Transient(format!("I/O error: {e}")),
        sqlx::Error::Database(db) => {
            let code = db.code();
            match code.as_deref() {
                Some(code) if RETRYABLE_SQLSTATES.contains(&code) => {
                    StoreError::Transient(format!("{code}: {}", db.message()))
                }
                Some(code) if CONSTRAINT_SQLSTATES.contains(&code) => StoreError::Constraint(
                    db.constraint()
                        .map_or_else(|| db.message().to_string(), ToString::to_string),
                ),
                _ => StoreError::Database(db.message().to_string()),
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Decode(err.to_string()),
        other => StoreError::Database(other.to_string()),
    }
}

/// Narrow a stored integer into the domain type, failing as a decode error.
pub(crate) fn narrow<T, U>(value: T, column: &str) -> Result<U, StoreError>
where
    U: TryFrom<T>,
    T: Copy + std::fmt::Display,
{
    U::try_from(value).map_err(|_| StoreError::Decode(format!("{column} out of range: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_retryable() {
        assert!(store_error(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn missing_rows_and_columns_are_not_retryable() {
        assert!(matches!(
            store_error(sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
        assert!(matches!(
            store_error(sqlx::Error::ColumnNotFound("total_amount".into())),
            StoreError::Decode(_)
        ));
    }

    #[test]
    fn narrowing_rejects_out_of_range_values() {
        assert_eq!(narrow::<i32, u32>(90, "duration_minutes").ok(), Some(90));
        assert!(matches!(
            narrow::<i32, u32>(-1, "duration_minutes"),
            Err(StoreError::Decode(_))
        ));
    }
}
