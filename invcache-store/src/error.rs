//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Insert of an id that already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Kind is not part of the store schema.
    #[error("unknown kind: {0}")]
    UnknownKind(String),

    /// Schema declares an unusable table or column name.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Predicate cannot be evaluated.
    #[error("predicate: {0}")]
    Predicate(String),

    /// Store has been closed.
    #[error("store closed")]
    Closed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Errors that indicate the backing file or connection is unusable,
    /// as opposed to errors caused by the request itself.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Database(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
