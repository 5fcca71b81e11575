//! Collaborator interfaces
//!
//! The cache never touches page tables or buffer memory itself. Hardware
//! mapping and cache maintenance go through [`DmaOps`], buffer identity
//! through [`BufferHandle`].

use crate::sg::{DmaDirection, MapAttrs, ScatterEntry};
use crate::Result;
use std::fmt;
use std::sync::Arc;

/// Identity of a device. Two mappings belong to the same device iff their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Opaque buffer identity, used only as an ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Anything that can name the buffer it refers to.
pub trait BufferHandle {
    /// Stable identity of the underlying buffer
    fn identity(&self) -> BufferId;
}

impl BufferHandle for BufferId {
    fn identity(&self) -> BufferId {
        *self
    }
}

/// DMA mapping backend.
///
/// Every method may block. The cache guarantees none of them is called while
/// it holds the registry lock or a buffer's mapping-list lock.
pub trait DmaOps: Send + Sync {
    /// Map `sgl` for `dev`, filling in `dma_address`/`dma_length` of each
    /// entry. Returns the number of mapped entries; zero means failure.
    fn map_sg(
        &self,
        dev: DeviceId,
        sgl: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: MapAttrs,
    ) -> Result<usize>;

    /// Reverse a previous [`DmaOps::map_sg`].
    fn unmap_sg(&self, dev: DeviceId, sgl: &[ScatterEntry], dir: DmaDirection, attrs: MapAttrs);

    fn sync_sg_for_device(&self, dev: DeviceId, sgl: &[ScatterEntry], dir: DmaDirection);

    fn sync_sg_for_cpu(&self, dev: DeviceId, sgl: &[ScatterEntry], dir: DmaDirection);

    /// Whether `dev` snoops CPU caches. Coherent devices get a full fence
    /// before a reused mapping is handed back.
    fn is_coherent(&self, _dev: DeviceId) -> bool {
        false
    }
}

impl<T: DmaOps + ?Sized> DmaOps for Arc<T> {
    fn map_sg(
        &self,
        dev: DeviceId,
        sgl: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: MapAttrs,
    ) -> Result<usize> {
        (**self).map_sg(dev, sgl, dir, attrs)
    }

    fn unmap_sg(&self, dev: DeviceId, sgl: &[ScatterEntry], dir: DmaDirection, attrs: MapAttrs) {
        (**self).unmap_sg(dev, sgl, dir, attrs)
    }

    fn sync_sg_for_device(&self, dev: DeviceId, sgl: &[ScatterEntry], dir: DmaDirection) {
        (**self).sync_sg_for_device(dev, sgl, dir)
    }

    fn sync_sg_for_cpu(&self, dev: DeviceId, sgl: &[ScatterEntry], dir: DmaDirection) {
        (**self).sync_sg_for_cpu(dev, sgl, dir)
    }

    fn is_coherent(&self, dev: DeviceId) -> bool {
        (**self).is_coherent(dev)
    }
}
