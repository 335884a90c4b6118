//! Per-key advisory writer locks.
//!
//! Writers to one staged object (`staging:<bucket>/<folder>/<object>`) or one
//! warehouse table (`dw:<db>/<table>`) hold that key's lock for the whole
//! operation. Readers never take these locks; they see committed catalog
//! state only. Operations that touch several keys acquire them in sorted
//! order through [`KeyedLocks::acquire_many`], so two writers can never wait
//! on each other in a cycle.
//!
//! Map entries are removed when the last holder releases and nobody waits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Registry = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    registry: Registry,
}

/// Held lock on one key. Released on drop.
pub struct KeyGuard {
    key: String,
    registry: Registry,
    _guard: OwnedMutexGuard<()>,
}

/// Held locks on several keys, acquired in sorted order.
pub struct LockSet {
    _guards: Vec<KeyGuard>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut map = self.registry.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            registry: self.registry.clone(),
            _guard: guard,
        }
    }

    pub async fn acquire_many<I, S>(&self, keys: I) -> LockSet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.acquire(key).await);
        }
        LockSet { _guards: guards }
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.registry
            .lock()
            .map(|m| m.len())
            .unwrap_or_else(|p| p.into_inner().len())
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut map = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        // One reference in the map, one inside our guard.
        if map
            .get(&self.key)
            .map(|m| Arc::strong_count(m) <= 2)
            .unwrap_or(false)
        {
            map.remove(&self.key);
        }
    }
}

/// Lock key for a warehouse table.
pub fn table_key(database: &str, table: &str) -> String {
    format!("dw:{}/{}", database, table)
}
