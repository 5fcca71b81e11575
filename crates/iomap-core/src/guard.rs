//! RAII handle to a cached mapping

use crate::cache::MappingCache;
use crate::mapping::Mapping;
use crate::ops::{BufferId, DeviceId, DmaOps};
use crate::sg::{DmaDirection, MapAttrs, ScatterEntry};
use std::sync::Arc;

/// Counted reference to a cached mapping.
///
/// While a guard is alive the mapping cannot be torn down: unmap and
/// teardown paths skip it and `unmap_all_for_device` reports it as busy.
/// Dropping the last reference performs the hardware unmap.
pub struct MappingGuard<'a, O: DmaOps> {
    cache: &'a MappingCache<O>,
    map: Arc<Mapping>,
}

impl<'a, O: DmaOps> MappingGuard<'a, O> {
    /// Wrap a mapping the caller holds a reference on
    pub(crate) fn new(cache: &'a MappingCache<O>, map: Arc<Mapping>) -> Self {
        Self { cache, map }
    }

    fn map(&self) -> &Mapping {
        &self.map
    }

    /// Device the buffer is mapped into
    pub fn device(&self) -> DeviceId {
        self.map().dev
    }

    /// Buffer this mapping belongs to
    pub fn buffer(&self) -> BufferId {
        self.map().meta.buffer
    }

    pub fn direction(&self) -> DmaDirection {
        self.map().dir
    }

    /// Attrs of the latest map or unmap request
    pub fn attrs(&self) -> MapAttrs {
        self.map().attrs()
    }

    /// Cached region list with device addresses
    pub fn entries(&self) -> &[ScatterEntry] {
        &self.map().sgl
    }

    pub fn nents(&self) -> usize {
        self.map().nents()
    }

    /// Physical start address recorded at map time
    pub fn start_address(&self) -> u64 {
        self.map().start_addr
    }

    /// Live references, this guard's included
    pub fn ref_count(&self) -> usize {
        self.map().refs.load()
    }
}

impl<O: DmaOps> Drop for MappingGuard<'_, O> {
    fn drop(&mut self) {
        self.cache.put_mapping(&self.map);
    }
}
