use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::resource::ResourceKey;

/// Latest manifest bytes per live resource.
///
/// Writers take exclusive access, readers shared access. Snapshots are owned
/// copies, so assembling the catalog never observes a half-applied write.
pub trait CatalogIndex: Send + Sync {
    fn get(&self, key: &ResourceKey) -> Option<Vec<u8>>;
    fn set(&self, key: ResourceKey, manifest: Vec<u8>);
    /// Returns whether an entry was removed.
    fn delete(&self, key: &ResourceKey) -> bool;
    fn snapshot(&self) -> BTreeMap<ResourceKey, Vec<u8>>;
    /// Swap the whole contents in one step.
    fn replace(&self, entries: BTreeMap<ResourceKey, Vec<u8>>);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, key: &ResourceKey) -> bool {
        self.get(key).is_some()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryIndex {
    entries: RwLock<BTreeMap<ResourceKey, Vec<u8>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CatalogIndex for InMemoryIndex {
    fn get(&self, key: &ResourceKey) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: ResourceKey, manifest: Vec<u8>) {
        self.entries.write().insert(key, manifest);
    }

    fn delete(&self, key: &ResourceKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    fn snapshot(&self) -> BTreeMap<ResourceKey, Vec<u8>> {
        self.entries.read().clone()
    }

    fn replace(&self, entries: BTreeMap<ResourceKey, Vec<u8>>) {
        *self.entries.write() = entries;
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.read().contains_key(key)
    }
}
