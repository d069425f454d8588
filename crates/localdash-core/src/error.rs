//! Error types for localdash-core

use thiserror::Error;

/// Result type alias using localdash-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in localdash-core operations
///
/// "Not found" and "insufficient balance" are expected outcomes and are
/// reported through `Option`, `bool` or [`crate::ledger::SpendOutcome`]
/// instead of this type.
#[derive(Error, Debug)]
pub enum Error {
    /// Persistence substrate failure (unavailable, full, corrupted)
    #[error("Storage error: {0}")]
    Storage(String),

    /// A write collided with a unique field
    #[error("Unique constraint violated on {collection}.{field}")]
    ConstraintViolation { collection: String, field: String },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Ledger amount outside the accepted range for the operation
    #[error("Invalid amount: {0} (must be greater than zero)")]
    InvalidAmount(i64),

    /// A balance would leave the `i64` range
    #[error("Balance of {0} would overflow")]
    BalanceOverflow(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error came from the persistence substrate itself.
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, ref message) = error {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                return constraint_from_message(message.as_deref().unwrap_or_default());
            }
        }
        Self::Storage(error.to_string())
    }
}

/// Map SQLite's `UNIQUE constraint failed: doc_users.f_email` to a typed error.
fn constraint_from_message(message: &str) -> Error {
    let target = message
        .rsplit(": ")
        .next()
        .and_then(|columns| columns.split(',').next())
        .map(str::trim)
        .unwrap_or_default();

    let (table, column) = target.split_once('.').unwrap_or(("", target));
    let collection = table.strip_prefix("doc_").unwrap_or(table);
    let field = column.strip_prefix("f_").unwrap_or(column);

    Error::ConstraintViolation {
        collection: collection.to_string(),
        field: field.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_failure_maps_to_constraint_violation() {
        let error = constraint_from_message("UNIQUE constraint failed: doc_users.f_email");
        match error {
            Error::ConstraintViolation { collection, field } => {
                assert_eq!(collection, "users");
                assert_eq!(field, "email");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn storage_errors_are_flagged() {
        assert!(Error::Storage("disk full".into()).is_storage());
        assert!(!Error::InvalidAmount(0).is_storage());
    }
}
