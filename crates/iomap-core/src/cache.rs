//! Mapping cache
//!
//! Caches the result of mapping a buffer into a device so repeated requests
//! from the same device reuse it. The hardware unmap is tied to the final
//! release of a mapping's reference, and every [`DmaOps`] call is made with
//! no cache lock held. Teardown paths collect dead mappings under the locks
//! and unmap them once the locks are dropped.

use crate::guard::MappingGuard;
use crate::mapping::Mapping;
use crate::meta::BufferMeta;
use crate::ops::{BufferHandle, DeviceId, DmaOps};
use crate::registry::MetaRegistry;
use crate::sg::{
    clone_sgl, copy_dma_results, start_address, DmaDirection, MapAttrs, MapShape, ScatterEntry,
};
use crate::{Error, Result};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

/// Default maximum number of registered buffers
pub const DEFAULT_CAPACITY: usize = 65536;

/// Reference-counted cache of buffer-to-device mappings
///
/// Dropping the cache frees every buffer still registered, unmapping all
/// mappings left behind, including delayed ones.
pub struct MappingCache<O: DmaOps> {
    /// Hardware backend
    ops: O,
    /// Buffer metas by identity
    registry: MetaRegistry,
}

impl<O: DmaOps> MappingCache<O> {
    /// Create an empty cache
    pub fn new(ops: O) -> Self {
        Self::with_capacity(ops, DEFAULT_CAPACITY)
    }

    /// Create an empty cache tracking at most `capacity` buffers
    pub fn with_capacity(ops: O, capacity: usize) -> Self {
        Self {
            ops,
            registry: MetaRegistry::new(capacity),
        }
    }

    /// Get the backend
    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Get capacity
    pub fn capacity(&self) -> usize {
        self.registry.capacity()
    }

    /// Number of buffers with a live meta
    pub fn buffer_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of mappings currently linked to `buf`
    pub fn mapping_count<B: BufferHandle + ?Sized>(&self, buf: &B) -> usize {
        match self.registry.lookup_get(buf.identity()) {
            Some(meta) => {
                let n = meta.len();
                self.put_meta(&meta);
                n
            }
            None => 0,
        }
    }

    /// Map the first `nents` entries of `sgl` for `dev`, reusing a cached
    /// mapping of `buf` when one exists.
    ///
    /// On success the entries carry their device addresses and `nents` is
    /// returned. A cached mapping is reused only if entry count, direction,
    /// attrs and start address all match; otherwise [`Error::Mismatch`].
    pub fn map_sg<B: BufferHandle + ?Sized>(
        &self,
        dev: DeviceId,
        sgl: &mut [ScatterEntry],
        nents: usize,
        dir: DmaDirection,
        buf: &B,
        attrs: MapAttrs,
    ) -> Result<usize> {
        let sgl = checked_entries(sgl, nents)
            .inspect_err(|e| tracing::error!(device = %dev, "rejecting map request: {e}"))?;
        let delayed = attrs.contains(MapAttrs::DELAYED_UNMAP);
        let (meta, created) = self.registry.lookup_or_create(buf.identity(), delayed)?;

        let ret = self.map_meta(dev, sgl, dir, attrs, &meta);
        if ret.is_err() && created {
            if meta.delayed.take() {
                self.put_meta(&meta);
            }
            if meta.is_empty() && meta.registered.take() {
                self.put_meta(&meta);
            }
        }
        self.put_meta(&meta);
        ret
    }

    fn map_meta(
        &self,
        dev: DeviceId,
        sgl: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: MapAttrs,
        meta: &Arc<BufferMeta>,
    ) -> Result<usize> {
        if let Some(map) = meta.lookup_get(dev) {
            return self.reuse(dev, sgl, dir, attrs, &map);
        }

        let map = Arc::new(self.create_mapping(dev, sgl, dir, attrs, meta)?);
        match meta.insert(Arc::clone(&map)) {
            Ok(None) => {
                tracing::debug!(
                    device = %dev,
                    buffer = %meta.buffer,
                    nents = sgl.len(),
                    ?dir,
                    %attrs,
                    "created mapping"
                );
                Ok(sgl.len())
            }
            Ok(Some(winner)) => {
                // Another thread mapped this device first
                self.discard(&map);
                self.reuse(dev, sgl, dir, attrs, &winner)
            }
            Err(e) => {
                self.discard(&map);
                Err(e)
            }
        }
    }

    fn create_mapping(
        &self,
        dev: DeviceId,
        sgl: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: MapAttrs,
        meta: &Arc<BufferMeta>,
    ) -> Result<Mapping> {
        if self.ops.map_sg(dev, sgl, dir, attrs)? == 0 {
            tracing::warn!(device = %dev, buffer = %meta.buffer, "dma map returned no entries");
            return Err(Error::MapFailed(dev));
        }
        let table = match clone_sgl(sgl) {
            Ok(table) => table,
            Err(e) => {
                self.ops
                    .unmap_sg(dev, sgl, dir, attrs | MapAttrs::SKIP_CPU_SYNC);
                return Err(e);
            }
        };
        Ok(Mapping::new(dev, table, dir, attrs, meta))
    }

    /// Hand a cached mapping back to a map request. Consumes the caller's
    /// lookup reference.
    fn reuse(
        &self,
        dev: DeviceId,
        sgl: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: MapAttrs,
        map: &Arc<Mapping>,
    ) -> Result<usize> {
        let requested = MapShape::of(sgl, dir, attrs);
        let stored = map.shape();
        if requested != stored {
            tracing::error!(
                device = %dev,
                buffer = %map.meta.buffer,
                %requested,
                %stored,
                start_differs = requested.start_addr != stored.start_addr,
                "lazy map request differs"
            );
            self.put_mapping(map);
            return Err(Error::Mismatch { requested, stored });
        }

        copy_dma_results(sgl, &map.sgl);
        if !attrs.contains(MapAttrs::SKIP_CPU_SYNC) {
            self.ops.sync_sg_for_device(dev, &map.sgl, map.dir);
        }
        // Outstanding CPU writes must be visible before the device runs
        if self.ops.is_coherent(dev) {
            fence(Ordering::SeqCst);
        }

        // Reusing a delayed mapping after its unmap: the lookup reference
        // becomes the insertion ownership again
        if !map.owned.set() {
            self.put_mapping(map);
        }
        Ok(sgl.len())
    }

    /// Undo a mapping that never made it into a list
    fn discard(&self, map: &Arc<Mapping>) {
        self.ops
            .unmap_sg(map.dev, &map.sgl, map.dir, map.attrs() | MapAttrs::SKIP_CPU_SYNC);
        self.put_meta(&map.meta);
    }

    /// Release the mapping `buf` has in `dev`.
    ///
    /// The hardware unmap happens here unless another reference is still
    /// outstanding (a delayed-unmap hold, a guard or an in-flight request),
    /// in which case it happens on that reference's release.
    pub fn unmap_sg<B: BufferHandle + ?Sized>(
        &self,
        dev: DeviceId,
        sgl: &[ScatterEntry],
        nents: usize,
        dir: DmaDirection,
        buf: &B,
        attrs: MapAttrs,
    ) {
        let buffer = buf.identity();
        let Some(meta) = self.registry.lookup_get(buffer) else {
            return;
        };
        let Some(map) = meta.lookup_get(dev) else {
            self.put_meta(&meta);
            return;
        };

        if dir != map.dir {
            tracing::warn!(
                device = %dev,
                buffer = %buffer,
                ?dir,
                original = ?map.dir,
                "unmap direction differs from original"
            );
        }
        let requested = sgl.get(..nents).map(start_address);
        if nents != map.nents() || requested != Some(map.start_addr) {
            tracing::debug!(
                device = %dev,
                buffer = %buffer,
                nents,
                original = map.nents(),
                "unmap request does not match cached layout"
            );
        }

        if !attrs.contains(MapAttrs::SKIP_CPU_SYNC) {
            self.ops.sync_sg_for_cpu(dev, &map.sgl, dir);
        }
        map.set_attrs(attrs);

        if map.owned.take() {
            self.put_mapping(&map);
        }
        self.put_mapping(&map);
        self.put_meta(&meta);
    }

    /// Tear down every mapping into `dev`.
    ///
    /// Mappings still referenced elsewhere are left alone and reported as
    /// [`Error::Busy`]; everything else is unmapped.
    pub fn unmap_all_for_device(&self, dev: DeviceId) -> Result<()> {
        let mut unmap_list = Vec::new();
        let mut busy = 0;
        self.registry.for_each(|meta| {
            busy += meta.drain(|map| map.dev == dev, &mut unmap_list);
        });

        // Locks are dropped; do the actual unmapping now
        for map in &unmap_list {
            self.finalize(map);
        }
        tracing::debug!(device = %dev, unmapped = unmap_list.len(), busy, "unmapped all for device");

        if busy > 0 {
            tracing::warn!(device = %dev, busy, "mappings still referenced");
            return Err(Error::Busy {
                device: dev,
                count: busy,
            });
        }
        Ok(())
    }

    /// Drop everything cached for `buf`. Called once by the buffer's owner
    /// when the buffer is released.
    pub fn buffer_freed<B: BufferHandle + ?Sized>(&self, buf: &B) {
        let buffer = buf.identity();
        let Some(meta) = self.registry.lookup_get(buffer) else {
            return;
        };

        let mut unmap_list = Vec::new();
        let busy = meta.drain(|_| true, &mut unmap_list);
        for map in &unmap_list {
            self.finalize(map);
        }
        if busy > 0 {
            tracing::warn!(buffer = %buffer, busy, "buffer freed with mappings still referenced");
        }

        if meta.delayed.take() {
            self.put_meta(&meta);
        }
        if meta.registered.take() {
            self.put_meta(&meta);
        }
        self.put_meta(&meta);
    }

    /// Take a counted handle on the mapping `buf` has in `dev`
    pub fn lookup<B: BufferHandle + ?Sized>(
        &self,
        dev: DeviceId,
        buf: &B,
    ) -> Option<MappingGuard<'_, O>> {
        let meta = self.registry.lookup_get(buf.identity())?;
        let map = meta.lookup_get(dev);
        // The mapping keeps its own reference on the meta
        self.put_meta(&meta);
        map.map(|map| MappingGuard::new(self, map))
    }

    /// Drop a mapping reference, destroying it if it was the last
    pub(crate) fn put_mapping(&self, map: &Arc<Mapping>) {
        map.refs.put(|| self.destroy_mapping(map));
    }

    fn destroy_mapping(&self, map: &Arc<Mapping>) {
        map.meta.remove(map);
        // Cache maintenance was done on the unmap path
        let attrs = map.attrs() | MapAttrs::SKIP_CPU_SYNC;
        self.ops.unmap_sg(map.dev, &map.sgl, map.dir, attrs);
        tracing::debug!(device = %map.dev, buffer = %map.meta.buffer, "destroyed mapping");
        self.put_meta(&map.meta);
    }

    /// Unmap a mapping already unlinked by a teardown drain
    fn finalize(&self, map: &Arc<Mapping>) {
        self.ops.unmap_sg(map.dev, &map.sgl, map.dir, map.attrs());
        tracing::debug!(device = %map.dev, buffer = %map.meta.buffer, "tore down mapping");
        self.put_meta(&map.meta);
    }

    fn put_meta(&self, meta: &Arc<BufferMeta>) {
        meta.refs.put(|| self.registry.remove(meta));
    }
}

impl<O: DmaOps> Drop for MappingCache<O> {
    fn drop(&mut self) {
        let mut buffers = Vec::new();
        self.registry.for_each(|meta| buffers.push(meta.buffer));
        for buffer in &buffers {
            self.buffer_freed(buffer);
        }
    }
}

fn checked_entries(sgl: &mut [ScatterEntry], nents: usize) -> Result<&mut [ScatterEntry]> {
    if sgl.is_empty() {
        return Err(Error::InvalidArgument("scatterlist is empty".to_string()));
    }
    if nents == 0 || nents > sgl.len() {
        return Err(Error::InvalidArgument(format!(
            "nents {} out of range 1..={}",
            nents,
            sgl.len()
        )));
    }
    Ok(&mut sgl[..nents])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::BufferId;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct FakeDma {
        maps: AtomicUsize,
        unmaps: Mutex<Vec<MapAttrs>>,
        fail: AtomicBool,
    }

    impl DmaOps for FakeDma {
        fn map_sg(
            &self,
            _dev: DeviceId,
            sgl: &mut [ScatterEntry],
            _dir: DmaDirection,
            _attrs: MapAttrs,
        ) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Ok(0);
            }
            self.maps.fetch_add(1, Ordering::SeqCst);
            for s in sgl.iter_mut() {
                s.dma_address = s.phys_addr | 0xf000_0000;
                s.dma_length = s.length;
            }
            Ok(sgl.len())
        }

        fn unmap_sg(&self, _dev: DeviceId, _sgl: &[ScatterEntry], _dir: DmaDirection, attrs: MapAttrs) {
            self.unmaps.lock().push(attrs);
        }

        fn sync_sg_for_device(&self, _dev: DeviceId, _sgl: &[ScatterEntry], _dir: DmaDirection) {}

        fn sync_sg_for_cpu(&self, _dev: DeviceId, _sgl: &[ScatterEntry], _dir: DmaDirection) {}
    }

    const DEV: DeviceId = DeviceId(1);
    const BUF: BufferId = BufferId(0x1000);

    fn sgl() -> Vec<ScatterEntry> {
        vec![ScatterEntry::new(0x4000, 0x1000), ScatterEntry::new(0x9000, 0x2000)]
    }

    fn meta_refs(cache: &MappingCache<FakeDma>) -> usize {
        let meta = cache.registry.lookup_get(BUF).unwrap();
        let n = meta.refs.load() - 1;
        cache.put_meta(&meta);
        n
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let cache = MappingCache::new(FakeDma::default());
        let err = cache
            .map_sg(DEV, &mut [], 1, DmaDirection::ToDevice, &BUF, MapAttrs::empty())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let mut list = sgl();
        for nents in [0, 3] {
            let err = cache
                .map_sg(DEV, &mut list, nents, DmaDirection::ToDevice, &BUF, MapAttrs::empty())
                .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
        assert_eq!(cache.buffer_count(), 0);
    }

    #[test]
    fn test_meta_refcount_accounting() {
        let cache = MappingCache::new(FakeDma::default());
        let mut list = sgl();
        cache
            .map_sg(DEV, &mut list, 2, DmaDirection::ToDevice, &BUF, MapAttrs::empty())
            .unwrap();
        // registry + mapping
        assert_eq!(meta_refs(&cache), 2);

        cache.unmap_sg(DEV, &list, 2, DmaDirection::ToDevice, &BUF, MapAttrs::empty());
        assert_eq!(meta_refs(&cache), 1);
        assert_eq!(cache.mapping_count(&BUF), 0);

        cache.buffer_freed(&BUF);
        assert_eq!(cache.buffer_count(), 0);
    }

    #[test]
    fn test_destroy_skips_cpu_sync() {
        let cache = MappingCache::new(FakeDma::default());
        let mut list = sgl();
        cache
            .map_sg(DEV, &mut list, 2, DmaDirection::ToDevice, &BUF, MapAttrs::empty())
            .unwrap();
        cache.unmap_sg(DEV, &list, 2, DmaDirection::ToDevice, &BUF, MapAttrs::WRITE_COMBINE);
        let unmaps = cache.ops().unmaps.lock();
        assert_eq!(
            *unmaps,
            vec![MapAttrs::WRITE_COMBINE | MapAttrs::SKIP_CPU_SYNC]
        );
    }

    #[test]
    fn test_failed_first_map_rolls_back_meta() {
        let cache = MappingCache::new(FakeDma::default());
        cache.ops().fail.store(true, Ordering::SeqCst);
        let mut list = sgl();
        let err = cache
            .map_sg(DEV, &mut list, 2, DmaDirection::ToDevice, &BUF, MapAttrs::DELAYED_UNMAP)
            .unwrap_err();
        assert!(matches!(err, Error::MapFailed(DEV)));
        assert_eq!(cache.buffer_count(), 0);
        assert!(cache.ops().unmaps.lock().is_empty());
    }

    #[test]
    fn test_registry_full() {
        let cache = MappingCache::with_capacity(FakeDma::default(), 1);
        let mut list = sgl();
        cache
            .map_sg(DEV, &mut list, 2, DmaDirection::ToDevice, &BUF, MapAttrs::empty())
            .unwrap();
        let err = cache
            .map_sg(DEV, &mut list, 2, DmaDirection::ToDevice, &BufferId(2), MapAttrs::empty())
            .unwrap_err();
        assert!(matches!(err, Error::RegistryFull(1)));
        assert_eq!(cache.ops().maps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_reuse_after_delayed_unmap() {
        let cache = MappingCache::new(FakeDma::default());
        let attrs = MapAttrs::DELAYED_UNMAP;
        let mut list = sgl();
        cache
            .map_sg(DEV, &mut list, 2, DmaDirection::FromDevice, &BUF, attrs)
            .unwrap();
        cache.unmap_sg(DEV, &list, 2, DmaDirection::FromDevice, &BUF, attrs);
        assert_eq!(cache.mapping_count(&BUF), 1);

        let mut again = sgl();
        cache
            .map_sg(DEV, &mut again, 2, DmaDirection::FromDevice, &BUF, attrs)
            .unwrap();
        assert_eq!(again[1].dma_address, 0xf000_9000);
        assert_eq!(cache.ops().maps.load(Ordering::SeqCst), 1);
        {
            let guard = cache.lookup(DEV, &BUF).unwrap();
            // ownership + delayed hold + guard
            assert_eq!(guard.ref_count(), 3);
        }

        cache.unmap_sg(DEV, &again, 2, DmaDirection::FromDevice, &BUF, attrs);
        assert!(cache.ops().unmaps.lock().is_empty());
        cache.buffer_freed(&BUF);
        assert_eq!(cache.ops().unmaps.lock().len(), 1);
        assert_eq!(cache.buffer_count(), 0);
    }
}
