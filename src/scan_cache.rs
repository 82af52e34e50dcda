use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::entity::Entity;
use crate::search::Items;

/// In-memory `basePath -> itemPath -> entities` mapping kept between
/// queries. It holds every classified entity of an item, not only the ones a
/// past query matched, so later queries can re-test any criteria against it.
#[derive(Debug)]
pub struct ScanCache<E: Entity> {
    roots: RwLock<BTreeMap<String, Items<E>>>,
}

impl<E: Entity> Default for ScanCache<E> {
    fn default() -> Self {
        Self {
            roots: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<E: Entity> ScanCache<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a root's items, `None` if the root was never scanned.
    pub fn items_for(&self, root: &str) -> Option<Items<E>> {
        self.roots.read().get(root).cloned()
    }

    pub fn contains_root(&self, root: &str) -> bool {
        self.roots.read().contains_key(root)
    }

    /// Merges `items` into the root's mapping, creating the root if needed.
    pub fn upsert(&self, root: &str, items: Items<E>) {
        let mut roots = self.roots.write();
        let mapping = roots.entry(root.to_string()).or_default();
        for (item, entities) in items {
            mapping.insert(item, entities);
        }
    }

    pub fn remove_item(&self, root: &str, item: &str) -> bool {
        self.roots
            .write()
            .get_mut(root)
            .is_some_and(|mapping| mapping.remove(item).is_some())
    }

    /// Drops every root, returning the roots that were cached.
    pub fn clear(&self) -> Vec<String> {
        let mut roots = self.roots.write();
        let cleared = roots.keys().cloned().collect();
        roots.clear();
        cleared
    }

    pub fn root_count(&self) -> usize {
        self.roots.read().len()
    }

    pub fn item_count(&self) -> usize {
        self.roots.read().values().map(|m| m.len()).sum()
    }
}
