//! Error types for the storage crate.

use thiserror::Error;

pub use thingbridge_core::Error as CoreError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage/Database error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Another process holds the database file.
    #[error("Store {0} is locked by another process")]
    Locked(String),

    /// Not found error.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Unique key already taken.
    #[error("Already exists: {0}")]
    Conflict(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<Error> for CoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => CoreError::Storage(e.to_string()),
            Error::Serialization(s) => CoreError::Serialization(s),
            Error::Storage(s) => CoreError::Storage(s),
            e @ Error::Locked(_) => CoreError::Storage(e.to_string()),
            Error::NotFound(s) => CoreError::NotFound(s),
            Error::Conflict(s) => CoreError::Conflict(s),
            Error::InvalidInput(s) => CoreError::Validation(s),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Every redb failure is a storage failure; the kind goes into the message.
macro_rules! redb_errors {
    ($($ty:ident => $kind:literal),* $(,)?) => {
        $(
            impl From<redb::$ty> for Error {
                fn from(e: redb::$ty) -> Self {
                    Error::Storage(format!(concat!("redb ", $kind, ": {}"), e))
                }
            }
        )*
    };
}

redb_errors! {
    Error => "error",
    DatabaseError => "open failed",
    TransactionError => "transaction failed",
    TableError => "table unavailable",
    StorageError => "I/O failed",
    CommitError => "commit failed",
}
