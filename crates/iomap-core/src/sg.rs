//! Scatter list definitions

use crate::{Error, Result};
use std::fmt;

/// One memory region of a buffer and, once mapped, where it landed in the
/// device's address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScatterEntry {
    /// Physical address of the region
    pub phys_addr: u64,
    /// Region length in bytes
    pub length: u32,
    /// Device-visible address, filled by the mapping
    pub dma_address: u64,
    /// Device-visible length, filled by the mapping
    pub dma_length: u32,
}

impl ScatterEntry {
    /// Create an unmapped entry
    pub fn new(phys_addr: u64, length: u32) -> Self {
        Self {
            phys_addr,
            length,
            dma_address: 0,
            dma_length: 0,
        }
    }
}

/// Physical start address of a region list, zero if empty
pub fn start_address(sgl: &[ScatterEntry]) -> u64 {
    sgl.first().map_or(0, |s| s.phys_addr)
}

/// Copy a region list into owned storage.
pub(crate) fn clone_sgl(sgl: &[ScatterEntry]) -> Result<Box<[ScatterEntry]>> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(sgl.len())
        .map_err(|_| Error::OutOfMemory("scatterlist clone"))?;
    table.extend_from_slice(sgl);
    Ok(table.into_boxed_slice())
}

/// Hand the stored DMA results of a cached mapping back to a caller's list.
pub(crate) fn copy_dma_results(dst: &mut [ScatterEntry], src: &[ScatterEntry]) {
    for (d, s) in dst.iter_mut().zip(src) {
        d.dma_address = s.dma_address;
        d.dma_length = s.dma_length;
        if s.dma_length == 0 {
            break;
        }
    }
}

/// DMA transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    Bidirectional,
    ToDevice,
    FromDevice,
}

bitflags::bitflags! {
    /// Mapping attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapAttrs: u64 {
        const WRITE_COMBINE = 1 << 2;
        const NO_KERNEL_MAPPING = 1 << 4;
        /// Skip cache maintenance on map, unmap and reuse
        const SKIP_CPU_SYNC = 1 << 5;
        const FORCE_CONTIGUOUS = 1 << 6;
        const PRIVILEGED = 1 << 9;
        /// Keep the hardware mapping cached past unmap until the buffer is torn down
        const DELAYED_UNMAP = 1 << 16;
    }
}

impl fmt::Display for MapAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.bits())
    }
}

/// Everything a reuse request must agree on with the cached mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapShape {
    pub nents: usize,
    pub dir: DmaDirection,
    pub attrs: MapAttrs,
    pub start_addr: u64,
}

impl MapShape {
    pub fn of(sgl: &[ScatterEntry], dir: DmaDirection, attrs: MapAttrs) -> Self {
        Self {
            nents: sgl.len(),
            dir,
            attrs,
            start_addr: start_address(sgl),
        }
    }
}

impl fmt::Display for MapShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nents={} dir={:?} attrs={} start={:#x}",
            self.nents, self.dir, self.attrs, self.start_addr
        )
    }
}
