//! Durable key-value store
//!
//! Documents are JSON-serialized and written to a [`StorageBackend`]
//! before the call returns, then mirrored in an in-memory cache that
//! serves subsequent reads.
//!
//! Reads never fail: a missing key, an unreadable backend, and a
//! document that no longer parses all come back as `None`. Writes are
//! serialized per store, so a read-modify-write through [`DurableStore::update`]
//! cannot interleave with another writer in the same process.

mod sqlite;

pub use sqlite::SqliteBackend;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Raw string storage underneath a [`DurableStore`]
///
/// Implementations must make `write` and `delete` durable before
/// returning.
pub trait StorageBackend: Send + Sync {
    /// Read the raw serialized value for a key
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Persist the raw serialized value for a key
    fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key; removing an absent key is not an error
    fn delete(&self, key: &str) -> Result<()>;
}

/// Volatile backend, for tests and hosts without a writable disk
///
/// Sharing one `Arc<MemoryBackend>` between two stores behaves like a
/// process restart: the second store starts with a cold cache but sees
/// every value the first one persisted.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values().remove(key);
        Ok(())
    }
}

/// Read-through cached document store
pub struct DurableStore {
    backend: Arc<dyn StorageBackend>,
    /// Cache of parsed documents; also the per-store write lock
    cache: Mutex<HashMap<String, Value>>,
}

impl DurableStore {
    /// Wrap a backend with an empty cache
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Store backed by a fresh [`MemoryBackend`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch a document, or `None` if it is absent or unreadable
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut cache = self.cache();
        let value = self.load(&mut cache, key)?;
        decode(key, value)
    }

    /// Whether any parsable document is stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        let mut cache = self.cache();
        self.load(&mut cache, key).is_some()
    }

    /// Persist a document, then cache it
    pub fn put<T: Serialize>(&self, key: &str, document: &T) -> Result<()> {
        let value = serde_json::to_value(document)?;
        let mut cache = self.cache();
        self.store(&mut cache, key, value)
    }

    /// Remove a document from the backend and the cache
    pub fn remove(&self, key: &str) -> Result<()> {
        let mut cache = self.cache();
        self.backend.delete(key)?;
        cache.remove(key);
        Ok(())
    }

    /// Read-modify-write a document under the store lock
    ///
    /// An absent or unreadable document is replaced by `T::default()`
    /// before `f` runs. The modified document is persisted before the
    /// lock is released.
    pub fn update<T, R, F>(&self, key: &str, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        let mut cache = self.cache();
        let mut document: T = self
            .load(&mut cache, key)
            .and_then(|value| decode(key, value))
            .unwrap_or_default();
        let result = f(&mut document);
        let value = serde_json::to_value(&document)?;
        self.store(&mut cache, key, value)?;
        Ok(result)
    }

    fn load(&self, cache: &mut HashMap<String, Value>, key: &str) -> Option<Value> {
        if let Some(value) = cache.get(key) {
            return Some(value.clone());
        }

        let raw = match self.backend.read(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read from durable store");
                return None;
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => {
                cache.insert(key.to_string(), value.clone());
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding unparsable stored document");
                None
            }
        }
    }

    fn store(&self, cache: &mut HashMap<String, Value>, key: &str, value: Value) -> Result<()> {
        let raw = serde_json::to_string(&value)?;
        self.backend.write(key, &raw)?;
        cache.insert(key.to_string(), value);
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(document) => Some(document),
        Err(e) => {
            tracing::warn!(key, error = %e, "Stored document has unexpected shape");
            None
        }
    }
}
