//! In-process coordination store.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{CoordinationStore, StoreError};
use crate::BoxFuture;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Instant,
}

impl Slot {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Coordination store held in a sharded concurrent map.
///
/// Only coordinates tasks within one process. Expired entries are dropped
/// lazily on access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CoordinationStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        // The read guard must be released before removing.
        let lookup = self
            .entries
            .get(key)
            .map(|slot| slot.is_live().then(|| slot.value.clone()));
        let value = match lookup {
            Some(Some(value)) => Some(value),
            Some(None) => {
                self.entries.remove_if(key, |_, slot| !slot.is_live());
                None
            }
            None => None,
        };
        Box::pin(async move { Ok(value) })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), StoreError>> {
        self.entries.insert(key.to_string(), Slot::new(value, ttl));
        Box::pin(async { Ok(()) })
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<bool, StoreError>> {
        let created = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_live() {
                    false
                } else {
                    e.insert(Slot::new(value, ttl));
                    true
                }
            }
            Entry::Vacant(e) => {
                e.insert(Slot::new(value, ttl));
                true
            }
        };
        Box::pin(async move { Ok(created) })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let existed = self.entries.remove(key).is_some();
        Box::pin(async move { Ok(existed) })
    }
}
