//! Error types for the store client.

use thiserror::Error;

/// Failure of a call to the authoritative store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Read of a key the store does not hold.
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Transport or connection failure, or the store reported itself unavailable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered and declined the write.
    #[error("Store rejected write: {0}")]
    Rejected(String),

    /// The client could not be built from its configuration.
    #[error("Invalid store client configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Unavailable(_) => "STORE_UNAVAILABLE",
            StoreError::Rejected(_) => "STORE_REJECTED",
            StoreError::Config(_) => "STORE_CONFIG",
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
