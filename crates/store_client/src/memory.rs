//! In-process store for tests and local development.
//!
//! Behaves like the authoritative store: writes are applied immediately and
//! reads see the latest write. Failures can be scripted so callers can
//! exercise their rejection and unavailability paths.

use crate::client::StoreClient;
use crate::error::{Result, StoreError};
use crate::types::{Ack, Entry};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Lock-free in-memory key/value store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
    /// Values the store declines to write.
    rejected_values: DashSet<String>,
    /// Number of upcoming calls that fail as unavailable.
    unavailable_calls: AtomicU32,
    /// Accepted writes.
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `entries`.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        for (key, value) in entries {
            store.entries.insert(key.into(), value.into());
        }
        store
    }

    /// Decline every future write of `value`.
    pub fn reject_value(&self, value: impl Into<String>) {
        self.rejected_values.insert(value.into());
    }

    /// Fail the next `calls` calls (of any kind) as unavailable.
    pub fn fail_next(&self, calls: u32) {
        self.unavailable_calls.store(calls, Ordering::SeqCst);
    }

    /// Number of writes the store has accepted.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        let failed = self
            .unavailable_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::Unavailable("memory store scripted outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn write(&self, key: &str, value: &str) -> Result<Ack> {
        self.check_available()?;
        if self.rejected_values.contains(value) {
            return Err(StoreError::Rejected(format!("value '{}' not accepted", value)));
        }

        self.entries.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Ack {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    async fn read(&self, key: &str) -> Result<String> {
        self.check_available()?;
        self.entries
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<Entry>> {
        self.check_available()?;
        let mut entries: Vec<Entry> = self
            .entries
            .iter()
            .map(|e| Entry::new(e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryStore::new();
        store.write("a", "1").await.unwrap();
        store.write("a", "2").await.unwrap();

        assert_eq!(store.read("a").await.unwrap(), "2");
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_list_is_sorted_by_key() {
        let store = MemoryStore::with_entries([("b", "2"), ("a", "1")]);
        let keys: Vec<String> = store.list().await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let store = MemoryStore::new();
        store.reject_value("nope");
        store.fail_next(1);

        assert!(matches!(store.read("a").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.read("a").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.write("a", "nope").await, Err(StoreError::Rejected(_))));
        assert_eq!(store.write_count(), 0);
    }
}
