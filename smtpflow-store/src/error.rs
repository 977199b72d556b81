//! Error types for the smtpflow-store crate.

use thiserror::Error;

/// Failure of the backing storage itself.
///
/// Business outcomes (unknown tracking id, quota exhausted, bad credentials)
/// are never reported through this type.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Storage worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Specialized `Result` type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupted_display() {
        let err = StoreError::Corrupted("status 'lost' is not a message status".to_string());
        assert_eq!(
            err.to_string(),
            "Corrupted record: status 'lost' is not a message status"
        );
    }

    #[test]
    fn sqlite_error_conversion() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(err.to_string().starts_with("SQLite error"));
    }
}
