//! Redb backend for task results and idempotency records.
//!
//! Each value is stored as an 8-byte big-endian expiry (Unix millis, 0 for
//! none) followed by the payload, so expiry survives restarts without a
//! second table.

use crate::backend::{expiry_for, is_expired, now_millis};
use crate::{StoreBackend, StoreError};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DOCFLOW_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("docflow_kv");

const HEADER_LEN: usize = 8;

fn encode(value: &[u8], expires_at: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + value.len());
    out.extend_from_slice(&expires_at.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode(raw: &[u8]) -> Result<(u64, &[u8]), StoreError> {
    if raw.len() < HEADER_LEN {
        return Err(StoreError::Serialization(format!(
            "stored entry too short: {} bytes",
            raw.len()
        )));
    }
    let (head, payload) = raw.split_at(HEADER_LEN);
    let mut expiry = [0u8; HEADER_LEN];
    expiry.copy_from_slice(head);
    Ok((u64::from_be_bytes(expiry), payload))
}

fn backend_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::backend(err.to_string())
}

/// Persistent backend; `Arc<Database>` makes it cheap to share.
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open or create a database at `path` and make sure the table exists.
    ///
    /// ```no_run
    /// use store::RedbBackend;
    ///
    /// let backend = RedbBackend::open("/tmp/docflow.redb").unwrap();
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(backend_err)?;

        let write_txn = db.begin_write().map_err(backend_err)?;
        {
            let _table = write_txn.open_table(DOCFLOW_TABLE).map_err(backend_err)?;
        }
        write_txn.commit().map_err(backend_err)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl StoreBackend for RedbBackend {
    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let encoded = encode(value, expiry_for(ttl));
        let write_txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut table = write_txn.open_table(DOCFLOW_TABLE).map_err(backend_err)?;
            table.insert(key, encoded.as_slice()).map_err(backend_err)?;
        }
        write_txn.commit().map_err(backend_err)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend_err)?;
        let table = read_txn.open_table(DOCFLOW_TABLE).map_err(backend_err)?;

        match table.get(key).map_err(backend_err)? {
            Some(guard) => {
                let (expires_at, payload) = decode(guard.value())?;
                if is_expired(expires_at, now_millis()) {
                    Ok(None)
                } else {
                    Ok(Some(payload.to_vec()))
                }
            }
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut table = write_txn.open_table(DOCFLOW_TABLE).map_err(backend_err)?;
            table.remove(key).map_err(backend_err)?;
        }
        write_txn.commit().map_err(backend_err)?;
        Ok(())
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        // Redb serializes write transactions, so check-then-insert is atomic.
        let write_txn = self.db.begin_write().map_err(backend_err)?;
        let inserted = {
            let mut table = write_txn.open_table(DOCFLOW_TABLE).map_err(backend_err)?;
            let live = match table.get(key).map_err(backend_err)? {
                Some(guard) => {
                    let (expires_at, _) = decode(guard.value())?;
                    !is_expired(expires_at, now_millis())
                }
                None => false,
            };
            if live {
                false
            } else {
                let encoded = encode(value, expiry_for(ttl));
                table.insert(key, encoded.as_slice()).map_err(backend_err)?;
                true
            }
        };
        write_txn.commit().map_err(backend_err)?;
        Ok(inserted)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let write_txn = self.db.begin_write().map_err(backend_err)?;
        let removed = {
            let mut table = write_txn.open_table(DOCFLOW_TABLE).map_err(backend_err)?;
            let mut expired = Vec::new();
            for item in table.iter().map_err(backend_err)? {
                let (key, value) = item.map_err(backend_err)?;
                let (expires_at, _) = decode(value.value())?;
                if is_expired(expires_at, now) {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(backend_err)?;
            }
            expired.len()
        };
        write_txn.commit().map_err(backend_err)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_temp() -> (RedbBackend, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let backend = RedbBackend::open(file.path()).unwrap();
        (backend, file)
    }

    #[test]
    fn put_get_delete() {
        let (backend, _file) = open_temp();
        backend.put("task_result:1", b"{\"ok\":true}", None).unwrap();
        assert_eq!(
            backend.get("task_result:1").unwrap(),
            Some(b"{\"ok\":true}".to_vec())
        );
        backend.delete("task_result:1").unwrap();
        assert_eq!(backend.get("task_result:1").unwrap(), None);
    }

    #[test]
    fn expiry_is_honored_and_purged() {
        let (backend, _file) = open_temp();
        backend.put("gone", b"x", Some(Duration::from_millis(1))).unwrap();
        backend.put("kept", b"y", Some(Duration::from_secs(60))).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(backend.get("gone").unwrap(), None);
        assert_eq!(backend.purge_expired().unwrap(), 1);
        assert_eq!(backend.get("kept").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn put_if_absent_is_first_writer_wins() {
        let (backend, _file) = open_temp();
        assert!(backend.put_if_absent("idempotency:k", b"a", None).unwrap());
        assert!(!backend.put_if_absent("idempotency:k", b"b", None).unwrap());
        assert_eq!(backend.get("idempotency:k").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn reopen_preserves_data() {
        let file = NamedTempFile::new().unwrap();
        {
            let backend = RedbBackend::open(file.path()).unwrap();
            backend.put("k", b"persisted", None).unwrap();
        }
        let backend = RedbBackend::open(file.path()).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"persisted".to_vec()));
    }
}
