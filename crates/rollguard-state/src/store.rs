//! KvStore: the shared key-value contract, and its redb implementation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use rollguard_core::epoch_millis;
use tracing::debug;

use crate::entry;
use crate::error::{StateError, StateResult};
use crate::tables::KV;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Shared key-value store used for circuit-breaker state.
///
/// Implementations must make [`KvStore::compare_and_swap`] atomic per key.
pub trait KvStore: Send + Sync {
    /// Read a live (non-expired) value.
    fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// Insert or overwrite a value, optionally expiring after `ttl`.
    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()>;

    /// Delete a value. Returns true if a live value existed.
    fn delete(&self, key: &str) -> StateResult<bool>;

    /// Replace the value at `key` only if its current live value equals
    /// `expected` (`None` meaning absent). `new = None` deletes the key.
    ///
    /// Returns true if the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<(&[u8], Option<Duration>)>,
    ) -> StateResult<bool>;
}

/// Thread-safe key-value store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory redb store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> StateResult<u32> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for item in table.iter().map_err(map_err!(Read))? {
                let (key, value) = item.map_err(map_err!(Read))?;
                let key = key.value().to_string();
                if entry::decode(&key, value.value(), now)?.is_none() {
                    expired.push(key);
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed = expired.len() as u32;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if removed > 0 {
            debug!(removed, "purged expired entries");
        }
        Ok(removed)
    }
}

impl KvStore for RedbStore {
    fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(entry::decode(key, guard.value(), epoch_millis())?.map(<[u8]>::to_vec)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()> {
        let encoded = entry::encode(value, ttl, epoch_millis());
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            table
                .insert(key, encoded.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StateResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            let removed = table
                .remove(key)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec());
            existed = match removed {
                Some(raw) => entry::decode(key, &raw, now)?.is_some(),
                None => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "entry deleted");
        Ok(existed)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<(&[u8], Option<Duration>)>,
    ) -> StateResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let swapped;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let live = match &current {
                Some(raw) => entry::decode(key, raw, now)?,
                None => None,
            };
            swapped = live == expected;
            if swapped {
                match new {
                    Some((value, ttl)) => {
                        let encoded = entry::encode(value, ttl, now);
                        table
                            .insert(key, encoded.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    None => {
                        table.remove(key).map_err(map_err!(Write))?;
                    }
                }
            }
        }
        if swapped {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(swapped)
    }
}
