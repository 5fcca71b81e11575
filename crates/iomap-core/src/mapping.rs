//! Per-(buffer, device) mapping record

use crate::meta::BufferMeta;
use crate::ops::DeviceId;
use crate::refcount::{Hold, RefCount};
use crate::sg::{start_address, DmaDirection, MapAttrs, MapShape, ScatterEntry};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A buffer mapped into one device's address space.
///
/// Counted references come from the insertion ownership (`owned`), the
/// delayed-unmap hold (`delayed`), in-flight lookups and outstanding guards.
/// The hardware unmap happens when the last of them is released.
pub(crate) struct Mapping {
    pub(crate) dev: DeviceId,
    /// Owned copy of the region list, including the DMA results
    pub(crate) sgl: Box<[ScatterEntry]>,
    pub(crate) dir: DmaDirection,
    /// Latest attrs; unmap overwrites them
    attrs: AtomicU64,
    pub(crate) start_addr: u64,
    /// Backpointer; each mapping holds one reference on its meta
    pub(crate) meta: Arc<BufferMeta>,
    pub(crate) refs: RefCount,
    pub(crate) owned: Hold,
    pub(crate) delayed: Hold,
}

impl Mapping {
    /// Build a record for a freshly mapped `sgl`. Takes a reference on
    /// `meta`, which the caller must already hold one on.
    pub(crate) fn new(
        dev: DeviceId,
        sgl: Box<[ScatterEntry]>,
        dir: DmaDirection,
        attrs: MapAttrs,
        meta: &Arc<BufferMeta>,
    ) -> Self {
        let delayed = attrs.contains(MapAttrs::DELAYED_UNMAP);
        meta.refs.get();
        let start_addr = start_address(&sgl);
        Self {
            dev,
            sgl,
            dir,
            attrs: AtomicU64::new(attrs.bits()),
            start_addr,
            meta: Arc::clone(meta),
            refs: RefCount::new(1 + usize::from(delayed)),
            owned: Hold::new(true),
            delayed: Hold::new(delayed),
        }
    }

    pub(crate) fn nents(&self) -> usize {
        self.sgl.len()
    }

    pub(crate) fn attrs(&self) -> MapAttrs {
        MapAttrs::from_bits_retain(self.attrs.load(Ordering::SeqCst))
    }

    pub(crate) fn set_attrs(&self, attrs: MapAttrs) {
        self.attrs.store(attrs.bits(), Ordering::SeqCst);
    }

    pub(crate) fn shape(&self) -> MapShape {
        MapShape {
            nents: self.nents(),
            dir: self.dir,
            attrs: self.attrs(),
            start_addr: self.start_addr,
        }
    }

    /// Release the structural holds with the no-op destructor. Returns
    /// whether this dropped the last reference.
    pub(crate) fn release_holds(&self) -> bool {
        let mut last = false;
        if self.owned.take() {
            last |= self.refs.put_noop();
        }
        if self.delayed.take() {
            last |= self.refs.put_noop();
        }
        last
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("dev", &self.dev)
            .field("buffer", &self.meta.buffer)
            .field("shape", &self.shape())
            .field("refs", &self.refs.load())
            .field("owned", &self.owned.is_held())
            .field("delayed", &self.delayed.is_held())
            .finish()
    }
}
