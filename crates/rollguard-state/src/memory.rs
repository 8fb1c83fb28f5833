//! In-process [`KvStore`] for tests and single-node deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rollguard_core::epoch_millis;

use crate::entry;
use crate::error::StateResult;
use crate::store::KvStore;

/// `Mutex<HashMap>`-backed store. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live(entries: &HashMap<String, Vec<u8>>, key: &str, now: u64) -> StateResult<Option<Vec<u8>>> {
        match entries.get(key) {
            Some(raw) => Ok(entry::decode(key, raw, now)?.map(<[u8]>::to_vec)),
            None => Ok(None),
        }
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let entries = self.lock();
        Self::live(&entries, key, epoch_millis())
    }

    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()> {
        let encoded = entry::encode(value, ttl, epoch_millis());
        self.lock().insert(key.to_string(), encoded);
        Ok(())
    }

    fn delete(&self, key: &str) -> StateResult<bool> {
        let now = epoch_millis();
        match self.lock().remove(key) {
            Some(raw) => Ok(entry::decode(key, &raw, now)?.is_some()),
            None => Ok(false),
        }
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<(&[u8], Option<Duration>)>,
    ) -> StateResult<bool> {
        let now = epoch_millis();
        let mut entries = self.lock();
        let live = Self::live(&entries, key, now)?;
        if live.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some((value, ttl)) => {
                entries.insert(key.to_string(), entry::encode(value, ttl, now));
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }
}
