//! Wire types exchanged with the authoritative store.

use serde::{Deserialize, Serialize};

/// A key and its current value, as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The store's acknowledgment of an accepted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Key that was written.
    pub key: String,
    /// Value the store committed for the key.
    pub value: String,
}

/// Body of a write request: `POST /add/{key}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub value: String,
}

/// Error body the store may attach to a non-success response.
#[derive(Debug, Deserialize)]
pub(crate) struct StoreErrorBody {
    pub error: String,
}
