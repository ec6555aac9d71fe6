//! Error types for the script store and its collaborators.

use sw_core::MetaError;

/// Failure reported by a [`crate::Storage`] backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Invalid stored value at {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failure downloading a remote resource.
///
/// `Display` matches the text shown to users: `HTTP404 https://...`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP{status} {url}")]
    Http { status: u16, url: String },
    #[error("{message} {url}")]
    Network { url: String, message: String },
    #[error("{0}")]
    Storage(#[from] StorageError),
}

/// Errors returned by [`crate::ScriptStore`] operations.
///
/// Every variant displays as plain text so it can be relayed to the UI.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Script namespace conflicts! Please modify @name and @namespace.")]
    Conflict,
    #[error("Script not found: #{0}")]
    NotFound(u64),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
