//! Ordered index of buffer metas

use crate::meta::BufferMeta;
use crate::ops::BufferId;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry of every buffer that currently has a meta, keyed by buffer identity
pub(crate) struct MetaRegistry {
    tree: RwLock<BTreeMap<BufferId, Arc<BufferMeta>>>,
    capacity: usize,
}

impl MetaRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Find the meta for `buffer` and take a reference on it
    pub(crate) fn lookup_get(&self, buffer: BufferId) -> Option<Arc<BufferMeta>> {
        let tree = self.tree.read();
        tree.get(&buffer)
            .filter(|meta| meta.refs.get_unless_zero())
            .cloned()
    }

    /// Find or create the meta for `buffer`, with a reference taken for the
    /// caller. The flag tells whether this call created it.
    pub(crate) fn lookup_or_create(
        &self,
        buffer: BufferId,
        delayed: bool,
    ) -> Result<(Arc<BufferMeta>, bool)> {
        if let Some(meta) = self.lookup_get(buffer) {
            return Ok((meta, false));
        }

        let mut tree = self.tree.write();
        // Lost a race with another creator
        if let Some(meta) = tree.get(&buffer) {
            if meta.refs.get_unless_zero() {
                return Ok((Arc::clone(meta), false));
            }
        }
        // A dead meta still under this key is replaced; its destructor
        // leaves the new one alone
        let dying = tree.contains_key(&buffer);
        if !dying && tree.len() >= self.capacity {
            return Err(Error::RegistryFull(self.capacity));
        }
        let meta = Arc::new(BufferMeta::new(buffer, delayed));
        tree.insert(buffer, Arc::clone(&meta));
        tracing::debug!(buffer = %buffer, delayed, "created buffer meta");
        Ok((meta, true))
    }

    /// Excise `meta`. Only called once its count has reached zero.
    pub(crate) fn remove(&self, meta: &Arc<BufferMeta>) {
        let mut tree = self.tree.write();
        if tree
            .get(&meta.buffer)
            .is_some_and(|cur| Arc::ptr_eq(cur, meta))
        {
            tree.remove(&meta.buffer);
            tracing::debug!(buffer = %meta.buffer, "destroyed buffer meta");
        }
    }

    /// Visit every meta in key order under the read lock
    pub(crate) fn for_each(&self, mut f: impl FnMut(&Arc<BufferMeta>)) {
        let tree = self.tree.read();
        for meta in tree.values() {
            f(meta);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tree.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_lookup() {
        let registry = MetaRegistry::new(4);
        assert!(registry.lookup_get(BufferId(7)).is_none());

        let (meta, created) = registry.lookup_or_create(BufferId(7), false).unwrap();
        assert!(created);
        assert_eq!(meta.refs.load(), 2);

        let (again, created) = registry.lookup_or_create(BufferId(7), false).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&meta, &again));
        assert_eq!(meta.refs.load(), 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let registry = MetaRegistry::new(2);
        registry.lookup_or_create(BufferId(1), false).unwrap();
        registry.lookup_or_create(BufferId(2), false).unwrap();
        let err = registry.lookup_or_create(BufferId(3), false).unwrap_err();
        assert!(matches!(err, Error::RegistryFull(2)));
        // existing keys still resolve
        assert!(registry.lookup_or_create(BufferId(1), false).is_ok());
    }

    #[test]
    fn test_dead_meta_is_replaced() {
        let registry = MetaRegistry::new(1);
        let (old, _) = registry.lookup_or_create(BufferId(5), false).unwrap();
        old.refs.put_noop();
        assert!(old.refs.put_noop());
        assert!(registry.lookup_get(BufferId(5)).is_none());

        let (new, created) = registry.lookup_or_create(BufferId(5), false).unwrap();
        assert!(created);
        // the old destructor must not evict the replacement
        registry.remove(&old);
        let found = registry.lookup_get(BufferId(5)).unwrap();
        assert!(Arc::ptr_eq(&found, &new));

        registry.remove(&new);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_for_each_in_order() {
        let registry = MetaRegistry::new(8);
        for id in [30, 10, 20] {
            registry.lookup_or_create(BufferId(id), false).unwrap();
        }
        let mut seen = Vec::new();
        registry.for_each(|meta| seen.push(meta.buffer.0));
        assert_eq!(seen, vec![10, 20, 30]);
    }
}
