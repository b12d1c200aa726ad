//! Per-volume serialization of record read-modify-write cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hands out one async lock per volume ID.
///
/// Serializes writers within this process only and carries no volume state;
/// decisions are made on the record re-read under the lock. Entries are
/// dropped again once nobody holds or waits for them.
#[derive(Default)]
pub(crate) struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    pub(crate) async fn lock(&self, id: &str) -> RecordGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(id.to_string()).or_default().clone()
        };

        RecordGuard {
            locks: self,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

pub(crate) struct RecordGuard<'a> {
    locks: &'a RecordLocks,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self.locks.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lock) = locks.get(&self.id) {
            // Only the map still refers to it
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.id);
            }
        }
    }
}
