//! Store wrapper with injectable write failures.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use hookline_core::{
    store::UpdateFn, KeyValueStore, MemoryStore, Result, StoreError,
};

/// In-memory store whose writes fail for chosen key prefixes.
///
/// Reads always succeed, so tests can inspect what did get written.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    failing: Mutex<Vec<String>>,
}

impl FaultyStore {
    /// Creates a store with no failures injected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes writes to keys under `prefix` fail.
    pub fn fail_writes(&self, prefix: impl Into<String>) {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn heal(&self) {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// The underlying store.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self, key: &str) -> Result<()> {
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.iter().any(|prefix| key.starts_with(prefix.as_str())) {
            return Err(StoreError::backend(format!("injected write failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.check(key)?;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check(key)?;
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        self.inner.scan_prefix(prefix).await
    }

    async fn update(&self, key: &str, apply: UpdateFn) -> Result<Option<Bytes>> {
        self.check(key)?;
        self.inner.update(key, apply).await
    }
}
