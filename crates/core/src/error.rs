use thiserror::Error;

use crate::ResourceVersion;

/// Errors reported by a remote backend client.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// Transport-level failure; the caller may retry.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// An exact read asked for a version the backend has not reached yet.
    #[error("resource version {requested} is newer than current {current}")]
    FutureVersion { requested: ResourceVersion, current: ResourceVersion },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("too_large_resource_version: requested {requested}, current {actual}")]
    TooLargeResourceVersion { requested: ResourceVersion, actual: ResourceVersion },
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("invalid_state: {0}")]
    InvalidState(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// The requested watch window is no longer covered by the event buffer.
    #[error("resource_expired: {0}")]
    ResourceExpired(String),
    #[error("request_too_large: {size} bytes exceeds limit of {max}")]
    RequestTooLarge { size: usize, max: usize },
    #[error("cancelled")]
    Cancelled,
    #[error("transport: {0}")]
    Transport(BackendError),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<BackendError> for StorageError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(m) => StorageError::NotFound(m),
            BackendError::AlreadyExists(m) => StorageError::AlreadyExists(m),
            BackendError::Conflict(m) => StorageError::Conflict(m),
            BackendError::Unauthenticated(m) => StorageError::Unauthenticated(m),
            BackendError::FutureVersion { requested, current } => {
                StorageError::TooLargeResourceVersion { requested, actual: current }
            }
            other => StorageError::Transport(other),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Internal(format!("codec: {}", e))
    }
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }

    /// Clone-like copy used when one error must be reported to several watchers.
    /// Opaque transport errors are flattened into their message.
    pub fn duplicate(&self) -> StorageError {
        match self {
            StorageError::NotFound(m) => StorageError::NotFound(m.clone()),
            StorageError::AlreadyExists(m) => StorageError::AlreadyExists(m.clone()),
            StorageError::Conflict(m) => StorageError::Conflict(m.clone()),
            StorageError::TooLargeResourceVersion { requested, actual } => {
                StorageError::TooLargeResourceVersion { requested: *requested, actual: *actual }
            }
            StorageError::InvalidRequest(m) => StorageError::InvalidRequest(m.clone()),
            StorageError::InvalidState(m) => StorageError::InvalidState(m.clone()),
            StorageError::Internal(m) => StorageError::Internal(m.clone()),
            StorageError::Unauthenticated(m) => StorageError::Unauthenticated(m.clone()),
            StorageError::ResourceExpired(m) => StorageError::ResourceExpired(m.clone()),
            StorageError::RequestTooLarge { size, max } => StorageError::RequestTooLarge { size: *size, max: *max },
            StorageError::Cancelled => StorageError::Cancelled,
            StorageError::Transport(e) => StorageError::Transport(match e {
                BackendError::Unavailable(m) => BackendError::Unavailable(m.clone()),
                other => BackendError::Other(anyhow::anyhow!(other.to_string())),
            }),
        }
    }
}
