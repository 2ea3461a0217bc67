pub mod key;

use crate::errors::Result;
use dashmap::DashMap;
use key::ResourceKey;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read side of the local cache. Workers only ever see this trait.
pub trait Indexer<K>: Send + Sync {
    /// `Ok(None)` means the object is not (or no longer) cached.
    fn get_by_key(&self, key: &ResourceKey) -> Result<Option<Arc<K>>>;

    /// True once the first full listing has been applied.
    fn has_synced(&self) -> bool;

    fn list_keys(&self) -> Vec<ResourceKey>;
}

/// Result of replacing the whole cache with a fresh listing.
pub struct Replaced<K> {
    /// `(key, previous snapshot if any, new snapshot)` for every listed object.
    pub upserted: Vec<(ResourceKey, Option<Arc<K>>, Arc<K>)>,
    /// Cached objects that were missing from the listing.
    pub removed: Vec<(ResourceKey, Arc<K>)>,
}

/// In-memory key → snapshot map mirroring the remote store.
///
/// Snapshots are stored behind `Arc` and swapped whole, so a reader gets
/// either the previous or the next state of an object, never a mix.
pub struct Store<K> {
    items: DashMap<ResourceKey, Arc<K>>,
    synced: AtomicBool,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            items: DashMap::new(),
            synced: AtomicBool::new(false),
        }
    }
}

impl<K> Store<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a snapshot, returning the one it displaced.
    pub fn upsert(&self, key: ResourceKey, obj: Arc<K>) -> Option<Arc<K>> {
        self.items.insert(key, obj)
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.items.remove(key).map(|(_, obj)| obj)
    }

    pub fn replace(&self, listed: Vec<(ResourceKey, Arc<K>)>) -> Replaced<K> {
        let listed_keys: HashSet<ResourceKey> = listed.iter().map(|(k, _)| k.clone()).collect();

        let upserted = listed
            .into_iter()
            .map(|(key, obj)| {
                let previous = self.items.insert(key.clone(), obj.clone());
                (key, previous, obj)
            })
            .collect();

        let stale: Vec<ResourceKey> = self
            .items
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !listed_keys.contains(key))
            .collect();
        let removed = stale
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|obj| (key, obj)))
            .collect();

        Replaced { upserted, removed }
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<K: Send + Sync> Indexer<K> for Store<K> {
    fn get_by_key(&self, key: &ResourceKey) -> Result<Option<Arc<K>>> {
        Ok(self.items.get(key).map(|entry| entry.value().clone()))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn list_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.items.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}
