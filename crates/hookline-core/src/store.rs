//! Key-value storage seam.
//!
//! The monitor, metrics aggregator and retry checkpoints persist through
//! [`KeyValueStore`]. Values are opaque bytes; the typed helpers at the
//! bottom of this module encode them as JSON.
//!
//! Keys are namespaced by prefix:
//!
//! - `delivery/<event-id>` delivery records
//! - `metrics/global`, `metrics/topic/<topic>`, `metrics/shop/<shop>/<topic>`
//! - `retry/<event-id>` pending retry checkpoints

use std::{collections::BTreeMap, ops::Bound, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};

/// Read-modify-write step applied by [`KeyValueStore::update`].
///
/// Receives the current value and returns the replacement. Returning `None`
/// deletes the key.
pub type UpdateFn = Box<dyn FnOnce(Option<Bytes>) -> Result<Option<Bytes>> + Send>;

/// Persistent key-value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Reads a value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Writes a value, replacing any existing one.
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Removes a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Lists all entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>>;

    /// Atomically replaces the value under `key`.
    ///
    /// No other write to the same key interleaves between the read and the
    /// write. Returns the value that was stored.
    async fn update(&self, key: &str, apply: UpdateFn) -> Result<Option<Bytes>>;
}

/// In-process store backed by an ordered map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn update(&self, key: &str, apply: UpdateFn) -> Result<Option<Bytes>> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).cloned();

        match apply(current)? {
            Some(value) => {
                entries.insert(key.to_string(), value.clone());
                Ok(Some(value))
            },
            None => {
                entries.remove(key);
                Ok(None)
            },
        }
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| StoreError::codec(key, e.to_string()))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::codec(key, e.to_string()))
}

/// Reads and decodes a JSON value.
pub async fn load<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    store.get(key).await?.map(|bytes| decode(key, &bytes)).transpose()
}

/// Encodes and writes a JSON value.
pub async fn save<T: Serialize + Sync>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    store.put(key, encode(key, value)?).await
}

/// Atomically transforms a JSON value in place.
///
/// Returns the value that was stored, or `None` if `apply` deleted it.
pub async fn modify<T, F>(store: &dyn KeyValueStore, key: &str, apply: F) -> Result<Option<T>>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce(Option<T>) -> Option<T> + Send + 'static,
{
    let owned_key = key.to_string();
    let stored = store
        .update(
            key,
            Box::new(move |current| {
                let current = current.map(|bytes| decode::<T>(&owned_key, &bytes)).transpose()?;
                apply(current).map(|next| encode(&owned_key, &next)).transpose()
            }),
        )
        .await?;

    stored.map(|bytes| decode(key, &bytes)).transpose()
}

/// Reads and decodes every JSON value under `prefix`.
pub async fn scan<T: DeserializeOwned>(store: &dyn KeyValueStore, prefix: &str) -> Result<Vec<(String, T)>> {
    store
        .scan_prefix(prefix)
        .await?
        .into_iter()
        .map(|(key, bytes)| decode(&key, &bytes).map(|value| (key, value)))
        .collect()
}
