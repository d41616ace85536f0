use crate::StoreError;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Key-value backend where every entry may carry an expiry.
///
/// Expired entries are invisible to `get` and `put_if_absent` even before
/// `purge_expired` physically removes them.
pub trait StoreBackend: Send + Sync {
    /// Insert or replace. `ttl` of `None` keeps the entry forever.
    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;
    /// Live value for `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Insert only when no live entry exists. Returns whether the write happened.
    fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;
    /// Drop expired entries, returning how many were removed.
    fn purge_expired(&self) -> Result<usize, StoreError>;
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Configuration for selecting and building a backend.
///
/// ```
/// use store::BackendConfig;
///
/// let config = BackendConfig::in_memory();
/// let config = BackendConfig::redb("/data/docflow.redb");
/// ```
#[derive(Clone, Debug, Default)]
pub enum BackendConfig {
    /// Redb file at `path`. Requires the `backend-redb` feature.
    Redb { path: String },
    #[default]
    InMemory,
}

impl BackendConfig {
    pub fn in_memory() -> Self {
        BackendConfig::InMemory
    }

    pub fn redb<P: Into<String>>(path: P) -> Self {
        BackendConfig::Redb { path: path.into() }
    }

    pub fn build(&self) -> Result<Box<dyn StoreBackend>, StoreError> {
        match self {
            BackendConfig::InMemory => Ok(Box::new(InMemoryBackend::new())),
            BackendConfig::Redb { path } => {
                #[cfg(feature = "backend-redb")]
                {
                    Ok(Box::new(RedbBackend::open(path)?))
                }
                #[cfg(not(feature = "backend-redb"))]
                {
                    let _ = path;
                    Err(StoreError::Unavailable(
                        "redb backend disabled at compile time".into(),
                    ))
                }
            }
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Absolute expiry for `ttl`, 0 meaning never.
pub(crate) fn expiry_for(ttl: Option<Duration>) -> u64 {
    match ttl {
        Some(ttl) => now_millis().saturating_add(ttl.as_millis() as u64).max(1),
        None => 0,
    }
}

pub(crate) fn is_expired(expires_at: u64, now: u64) -> bool {
    expires_at != 0 && expires_at <= now
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: u64,
}

/// An in-memory backend using a `RwLock` around a `HashMap`.
pub struct InMemoryBackend {
    records: RwLock<HashMap<String, Entry>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBackend for InMemoryBackend {
    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    expires_at: expiry_for(ttl),
                },
            );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self
            .records
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        let now = now_millis();
        Ok(guard
            .get(key)
            .filter(|e| !is_expired(e.expires_at, now))
            .map(|e| e.value.clone()))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?
            .remove(key);
        Ok(())
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        // Check and insert under one write lock.
        let mut guard = self
            .records
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        let now = now_millis();
        if guard
            .get(key)
            .is_some_and(|e| !is_expired(e.expires_at, now))
        {
            return Ok(false);
        }
        guard.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: expiry_for(ttl),
            },
        );
        Ok(true)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        let now = now_millis();
        let before = guard.len();
        guard.retain(|_, e| !is_expired(e.expires_at, now));
        Ok(before - guard.len())
    }
}

/// Redb-backed persistent store.
#[cfg(feature = "backend-redb")]
pub mod redb;

#[cfg(feature = "backend-redb")]
pub use redb::RedbBackend;
