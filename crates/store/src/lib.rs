//! Docflow Result Store
//!
//! Durable key-value persistence for task outcomes and idempotency records,
//! independent of the task queue's own bookkeeping. Entries carry a TTL equal
//! to the result-retention window.
//!
//! - [`ResultStore`] keeps JSON results under `task_result:{task_id}`.
//! - [`IdempotencyStore`] maps caller keys to task ids under
//!   `idempotency:{key}` with first-writer-wins registration.
//!
//! Both sit on a [`StoreBackend`]: [`InMemoryBackend`] for tests and single
//! process deployments, [`RedbBackend`] (feature `backend-redb`) when results
//! must survive a restart.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

mod backend;
mod error;

pub use crate::backend::{BackendConfig, InMemoryBackend, StoreBackend};
#[cfg(feature = "backend-redb")]
pub use crate::backend::RedbBackend;
pub use crate::error::StoreError;

/// Key prefix for persisted task results.
pub const RESULT_PREFIX: &str = "task_result:";
/// Key prefix for idempotency records.
pub const IDEMPOTENCY_PREFIX: &str = "idempotency:";

/// Typed access to persisted task results.
#[derive(Clone)]
pub struct ResultStore {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Shared backend, for building sibling stores over the same storage.
    pub fn backend(&self) -> Arc<dyn StoreBackend> {
        Arc::clone(&self.backend)
    }

    /// Persist `result` for `task_id`, replacing any earlier value.
    pub fn store_result(&self, task_id: &str, result: &Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(result)?;
        self.backend
            .put(&format!("{RESULT_PREFIX}{task_id}"), &bytes, Some(self.ttl))?;
        debug!(task_id, bytes = bytes.len(), "result_stored");
        Ok(())
    }

    pub fn fetch_result(&self, task_id: &str) -> Result<Option<Value>, StoreError> {
        match self.backend.get(&format!("{RESULT_PREFIX}{task_id}"))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove expired entries from the shared backend.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        self.backend.purge_expired()
    }
}

/// Maps caller-supplied idempotency keys to the task they created.
#[derive(Clone)]
pub struct IdempotencyStore {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), ttl)
    }

    /// Task id previously registered for `key`.
    pub fn lookup(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.backend.get(&format!("{IDEMPOTENCY_PREFIX}{key}"))? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Record `task_id` for `key` unless a live record already exists.
    /// Returns `false` when another submission registered first.
    pub fn register(&self, key: &str, task_id: &str) -> Result<bool, StoreError> {
        self.backend.put_if_absent(
            &format!("{IDEMPOTENCY_PREFIX}{key}"),
            task_id.as_bytes(),
            Some(self.ttl),
        )
    }
}
