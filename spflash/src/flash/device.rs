//! Raw flash access.
//!
//! The [`FlashDevice`] trait separates the partition logic from the driver
//! that actually talks to NOR flash, eMMC or an image file:
//!
//! ```text
//! +------------------+     +------------------+
//! |  Update / Status |     |  Update / Status |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |  FlashDevice     |     |  FlashDevice     |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |   SPI NOR driver |     |   MemoryFlash    |
//! +------------------+     +------------------+
//!        Device              Host / tests
//! ```

use thiserror::Error;

/// Flash access errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    /// Access extends past the end of the device.
    #[error("flash access out of bounds: offset {offset:#x} + {len} bytes, device size {size:#x}")]
    OutOfBounds {
        /// Start offset.
        offset: usize,
        /// Access length.
        len: usize,
        /// Device size.
        size: usize,
    },

    /// Erase range is not page-aligned.
    #[error("misaligned erase: offset {offset:#x}, {len} bytes, page size {page_size}")]
    Misaligned {
        /// Start offset.
        offset: usize,
        /// Erase length.
        len: usize,
        /// Device page size.
        page_size: usize,
    },

    /// Driver-level failure.
    #[error("flash device error: {0}")]
    Device(String),
}

/// A flash device with NOR semantics.
///
/// Erase sets a page to all ones; program can only clear bits, so the stored
/// result is `old & data`.
pub trait FlashDevice {
    /// Total device size in bytes.
    fn size(&self) -> usize;

    /// Erase/program page size in bytes.
    fn page_size(&self) -> usize;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Erase `len` bytes starting at `offset`. Both must be page-aligned.
    fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError>;

    /// Program `data` at `offset`, clearing bits only.
    fn program(&mut self, offset: usize, data: &[u8]) -> Result<(), FlashError>;

    /// Read `len` bytes into a new buffer.
    fn read_vec(&mut self, offset: usize, len: usize) -> Result<Vec<u8>, FlashError> {
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }
}

/// RAM-backed flash, used for flash dump files and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFlash {
    data: Vec<u8>,
    page_size: usize,
}

impl MemoryFlash {
    /// Fully erased device of `size` bytes.
    pub fn new(size: usize, page_size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
            page_size,
        }
    }

    /// Device holding a copy of `data`.
    pub fn from_bytes(data: Vec<u8>, page_size: usize) -> Self {
        Self { data, page_size }
    }

    /// Current contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the device and return its contents.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), FlashError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(FlashError::OutOfBounds {
                offset,
                len,
                size: self.data.len(),
            }),
        }
    }
}

impl FlashDevice for MemoryFlash {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError> {
        if self.page_size == 0 || offset % self.page_size != 0 || len % self.page_size != 0 {
            return Err(FlashError::Misaligned {
                offset,
                len,
                page_size: self.page_size,
            });
        }
        self.check_bounds(offset, len)?;
        self.data[offset..offset + len].fill(0xFF);
        Ok(())
    }

    fn program(&mut self, offset: usize, data: &[u8]) -> Result<(), FlashError> {
        self.check_bounds(offset, data.len())?;
        for (cell, byte) in self.data[offset..offset + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        Ok(())
    }
}
