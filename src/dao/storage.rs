use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by change-feed backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient failure talking to the backend; callers may retry.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// What the backend was doing.
        message: String,
        /// Backend failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The addressed document does not exist.
    #[error("document `{path}` not found")]
    NotFound {
        /// `collection/id` of the missing document.
        path: String,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a not-found error for the given document path.
    pub fn not_found(path: impl ToString) -> Self {
        StorageError::NotFound {
            path: path.to_string(),
        }
    }
}
