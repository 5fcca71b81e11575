//! Error types for iomap

use crate::ops::DeviceId;
use crate::sg::MapShape;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("mapping registry full: capacity {0}")]
    RegistryFull(usize),

    #[error("dma mapping failed for device {0}")]
    MapFailed(DeviceId),

    #[error("lazy map request differs: requested {requested}, original {stored}")]
    Mismatch { requested: MapShape, stored: MapShape },

    #[error("{count} mapping(s) for device {device} still referenced")]
    Busy { device: DeviceId, count: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
