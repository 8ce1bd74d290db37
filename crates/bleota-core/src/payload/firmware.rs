//! Firmware image container.
//!
//! The image is treated as opaque bytes. It is shared read-only between the
//! session and the packetizer worker, so it lives behind an `Arc`.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Image too large: {actual} bytes, maximum {maximum}")]
    TooLarge { actual: usize, maximum: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Immutable firmware image.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Arc<[u8]>,
}

/// One sector of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector<'a> {
    pub index: usize,
    pub data: &'a [u8],
}

impl FirmwareImage {
    /// Largest image whose length fits the START command.
    pub const MAX_SIZE: usize = u32::MAX as usize;

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Result<Self, FirmwareError> {
        let data = data.into();
        if data.len() > Self::MAX_SIZE {
            return Err(FirmwareError::TooLarge {
                actual: data.len(),
                maximum: Self::MAX_SIZE,
            });
        }
        Ok(Self { data: data.into() })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FirmwareError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Image length as announced in the START command.
    pub fn len_u32(&self) -> u32 {
        // bounded by MAX_SIZE at construction
        self.data.len() as u32
    }

    /// Number of sectors of `sector_size` bytes (last one may be short).
    pub fn sector_count(&self, sector_size: usize) -> usize {
        self.data.len().div_ceil(sector_size)
    }

    /// Iterate the image in sectors of `sector_size` bytes.
    pub fn sectors(&self, sector_size: usize) -> impl Iterator<Item = Sector<'_>> {
        self.data
            .chunks(sector_size)
            .enumerate()
            .map(|(index, data)| Sector { index, data })
    }
}
