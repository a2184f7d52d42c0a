use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dao::storage::StorageError,
    state::state_machine::{PlanError, Rejection},
};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Engine is running in degraded mode without a healthy store.
    #[error("storage unavailable (degraded mode)")]
    Degraded,
    /// The intent was refused by game policy.
    #[error("rejected: {0}")]
    Rejected(Rejection),
    /// Invalid input provided by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// A stored record could not be encoded or decoded.
    #[error("malformed record")]
    Malformed(#[from] serde_json::Error),
    /// Both seats of the session are taken.
    #[error("session is full")]
    SessionFull,
    /// Operation exceeded its timeout limit.
    #[error("operation timed out")]
    Timeout,
}

impl ServiceError {
    /// Whether the failure is transient and the UI should offer a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Unavailable(StorageError::Unavailable { .. })
                | ServiceError::Degraded
                | ServiceError::Timeout
        )
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { path } => ServiceError::NotFound(path),
            other => ServiceError::Unavailable(other),
        }
    }
}

impl From<ValidationErrors> for ServiceError {
    fn from(err: ValidationErrors) -> Self {
        ServiceError::InvalidInput(format!("validation failed: {err}"))
    }
}

impl From<PlanError> for ServiceError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::InvalidTransition(invalid) => ServiceError::InvalidState(invalid.to_string()),
            PlanError::Rejected(Rejection::SessionFull) => ServiceError::SessionFull,
            PlanError::Rejected(rejection) => ServiceError::Rejected(rejection),
            PlanError::Oracle(err) => ServiceError::InvalidInput(err.to_string()),
        }
    }
}
