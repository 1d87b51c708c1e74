use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;
use crate::fetch::FetchError;
use crate::script::ScriptId;

/// Error classification handed to the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NamespaceConflict,
    InvalidScript,
    NotFound,
    MissingResource,
    FetchError,
    StorageError,
    InternalError,
}

/// Errors returned by the script store and its components.
///
/// `MissingResource` has no variant here: a blob that stays missing after the
/// automatic repair is reported on the injection result, not returned.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Script namespace conflicts with an existing script: {uri}")]
    NamespaceConflict { uri: String },

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("Script not found: #{0}")]
    NotFound(ScriptId),

    #[error("Storage error: {0}")]
    Backend(#[from] BackendError),

    #[error("Error fetching resource: {0}")]
    Fetch(#[from] FetchError),

    #[error("Script index lock failed: {0}")]
    Lock(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Map to the serializable classification
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NamespaceConflict { .. } => ErrorCode::NamespaceConflict,
            StoreError::InvalidScript(_) => ErrorCode::InvalidScript,
            StoreError::NotFound(_) => ErrorCode::NotFound,
            StoreError::Backend(_) => ErrorCode::StorageError,
            StoreError::Fetch(_) => ErrorCode::FetchError,
            StoreError::Lock(_) | StoreError::Task(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the same call may succeed when repeated
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Fetch(_))
    }

    pub fn invalid_script(reason: impl Into<String>) -> Self {
        StoreError::InvalidScript(reason.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StoreError::Lock(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
