//! iomap - Reference-counted cache of DMA buffer to device mappings

pub mod cache;
pub mod error;
pub mod guard;
mod mapping;
mod meta;
pub mod ops;
mod refcount;
mod registry;
pub mod sg;

pub use cache::{MappingCache, DEFAULT_CAPACITY};
pub use error::{Error, Result};
pub use guard::MappingGuard;
pub use ops::{BufferHandle, BufferId, DeviceId, DmaOps};
pub use sg::{start_address, DmaDirection, MapAttrs, MapShape, ScatterEntry};
