//! Per-app rollback locks.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of app ids with a rollback in flight.
///
/// Scope is one process: clones share the set, separate processes do not.
/// Two `rollguardd` processes (a `serve` plus a one-shot `rollback`, or
/// two daemons on different data dirs) can each roll the same app back at
/// once; run every trigger through a single daemon when that matters.
#[derive(Debug, Clone, Default)]
pub struct AppLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock for `app_id`, or `None` if it is already held.
    pub fn try_acquire(&self, app_id: &str) -> Option<AppLockGuard> {
        if !self.held().insert(app_id.to_string()) {
            return None;
        }
        Some(AppLockGuard {
            locks: self.clone(),
            app_id: app_id.to_string(),
        })
    }

    pub fn is_locked(&self, app_id: &str) -> bool {
        self.held().contains(app_id)
    }
}

/// Releases the app's lock when dropped.
#[derive(Debug)]
pub struct AppLockGuard {
    locks: AppLocks,
    app_id: String,
}

impl Drop for AppLockGuard {
    fn drop(&mut self) {
        self.locks.held().remove(&self.app_id);
    }
}
