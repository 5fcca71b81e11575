//! Per-buffer metadata and its mapping list

use crate::mapping::Mapping;
use crate::ops::{BufferId, DeviceId};
use crate::refcount::{Hold, RefCount};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Metadata for one buffer: the set of devices it is currently mapped into.
///
/// `refs` counts the registry membership (`registered`), the delayed-unmap
/// hold (`delayed`), one reference per live mapping and any in-flight
/// lookups. The meta leaves the registry when it drops to zero.
pub(crate) struct BufferMeta {
    /// Registry key, immutable
    pub(crate) buffer: BufferId,
    /// At most one live mapping per device; unordered
    maps: RwLock<Vec<Arc<Mapping>>>,
    pub(crate) refs: RefCount,
    pub(crate) registered: Hold,
    pub(crate) delayed: Hold,
}

impl BufferMeta {
    /// New meta owned by the registry and by the creating caller
    pub(crate) fn new(buffer: BufferId, delayed: bool) -> Self {
        Self {
            buffer,
            maps: RwLock::new(Vec::new()),
            refs: RefCount::new(2 + usize::from(delayed)),
            registered: Hold::new(true),
            delayed: Hold::new(delayed),
        }
    }

    /// Find the live mapping for `dev` and take a reference on it
    pub(crate) fn lookup_get(&self, dev: DeviceId) -> Option<Arc<Mapping>> {
        let maps = self.maps.read();
        maps.iter()
            .find(|m| m.dev == dev && m.refs.get_unless_zero())
            .cloned()
    }

    /// Add `map` to the list.
    ///
    /// If a live mapping for the same device got there first, `map` is not
    /// added and the existing one is returned with a reference taken.
    pub(crate) fn insert(&self, map: Arc<Mapping>) -> Result<Option<Arc<Mapping>>> {
        let mut maps = self.maps.write();
        if let Some(existing) = maps
            .iter()
            .find(|m| m.dev == map.dev && m.refs.get_unless_zero())
        {
            return Ok(Some(Arc::clone(existing)));
        }
        maps.try_reserve(1)
            .map_err(|_| Error::OutOfMemory("mapping list"))?;
        maps.push(map);
        Ok(None)
    }

    /// Unlink a dead mapping. Takes the write lock; the caller must not hold it.
    pub(crate) fn remove(&self, map: &Arc<Mapping>) {
        let mut maps = self.maps.write();
        if let Some(i) = maps.iter().position(|m| Arc::ptr_eq(m, map)) {
            maps.swap_remove(i);
        }
    }

    /// Release the structural holds of every mapping matching `pred`.
    ///
    /// Mappings that reach zero are unlinked and moved to `out`; their
    /// hardware teardown is left to the caller, outside the lock. Returns how
    /// many matching mappings are still referenced elsewhere.
    pub(crate) fn drain(
        &self,
        mut pred: impl FnMut(&Mapping) -> bool,
        out: &mut Vec<Arc<Mapping>>,
    ) -> usize {
        let mut maps = self.maps.write();
        let mut busy = 0;
        let mut i = 0;
        while i < maps.len() {
            let map = &maps[i];
            if !pred(map.as_ref()) {
                i += 1;
                continue;
            }
            if map.release_holds() {
                out.push(maps.swap_remove(i));
                continue;
            }
            // Zero here means another thread owns the teardown
            if map.refs.load() > 0 {
                busy += 1;
            }
            i += 1;
        }
        busy
    }

    /// Number of mappings in the list, including dying ones
    pub(crate) fn len(&self) -> usize {
        self.maps.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for BufferMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferMeta")
            .field("buffer", &self.buffer)
            .field("refs", &self.refs.load())
            .field("maps", &self.len())
            .finish()
    }
}
