//! Error types for fractal-core.

use thiserror::Error;

/// Result type alias using the fractal-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for memory operations
#[derive(Error, Debug)]
pub enum Error {
    // Caller mistakes: reported immediately, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    // Transient dependency failures after the retry budget is exhausted
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("All retriever arms failed")]
    RetrieverUnavailable,

    // Deadline expired or caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    // Unique-id collisions, missing schema: operator action required
    #[error("Integrity error: {0}")]
    Integrity(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // Completion / embedding provider errors
    #[error("Provider error: {0}")]
    Provider(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a store-unavailable error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create an integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Whether this error is worth retrying with backoff.
    ///
    /// Validation, cancellation and integrity failures are final. SQLite
    /// errors are transient only when the database is busy or locked.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StoreUnavailable(_) => true,
            Error::Provider(_) => true,
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::store_unavailable("down").is_transient());
        assert!(Error::Provider("timeout".into()).is_transient());
        assert!(!Error::validation("bad importance").is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::integrity("duplicate id").is_transient());
    }
}
