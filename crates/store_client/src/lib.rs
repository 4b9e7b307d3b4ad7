//! Client for the authoritative key/value store.
//!
//! The gateway only consumes a request/acknowledge interface from the store.
//! This crate provides:
//! - [`StoreClient`]: the seam the gateway programs against
//! - [`HttpStoreClient`]: the production HTTP/JSON implementation, with a
//!   transport-timeout retry policy
//! - [`MemoryStore`]: an in-process implementation for tests and local runs

pub mod client;
pub mod error;
pub mod memory;
pub mod types;

pub use client::{HttpStoreClient, StoreClient, StoreClientConfig, DEFAULT_STORE_URL};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use types::{Ack, Entry, WriteRequest};
