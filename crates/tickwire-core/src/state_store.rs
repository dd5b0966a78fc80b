//! Optional key-value persistence for circuit-breaker state.
//!
//! A [`StateStore`] lets breaker state survive process restarts. The client
//! works identically without one; store failures are reported to the caller,
//! which logs and continues on in-memory state.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Failure raised by a persistence backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("state store failure: {0}")]
pub struct StoreError(String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Minimal key-value contract for persisting component state.
pub trait StateStore: Send + Sync {
    /// Fetch a live (non-expired) value.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value that expires after `ttl`.
    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local store, mostly useful for tests and single-process setups.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Reads already ignore them; this just frees memory.
    pub fn purge_expired(&self) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::new("state store lock poisoned"))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::new("state store lock poisoned"))?;
        Ok(entries.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        }))
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::new("state store lock poisoned"))?;
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}
