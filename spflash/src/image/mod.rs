//! On-flash image format.
//!
//! A flash device (or image file) holds two equally sized partitions. Each
//! partition starts with a header block containing the [`PartitionHeader`]
//! followed by the region table; regions follow contiguously from block 1.
//!
//! ```text
//! +------------------------------+  block 0
//! | PartitionHeader (32B)        |
//! | RegionDescriptor[0] (16B)    |
//! | ...                          |
//! | RegionDescriptor[n-1] (16B)  |
//! +------------------------------+  block 1
//! | region 0                     |
//! +------------------------------+
//! | region 1                     |
//! +------------------------------+
//! | ...                          |
//! +------------------------------+
//! ```
//!
//! Every field is a little-endian `u32`. Checksums are CRC-32 over the bytes
//! preceding the checksum field.
//!
//! [`PartitionHeader`]: header::PartitionHeader

pub mod counter;
pub mod file;
pub mod header;
pub mod region;

use crc::{CRC_32_ISO_HDLC, Crc};

/// Flash block size in bytes. All offsets and sizes in the region table are
/// expressed in blocks.
pub const BLOCK_SIZE: usize = 4096;

/// Partition header magic ("PART").
pub const PARTITION_MAGIC: u32 = 0x5452_4150;

/// File wrapper magic ("FILE").
pub const FILE_MAGIC: u32 = 0x454C_4946;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the CRC-32 used by every checksum in the image format.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Number of blocks needed to hold `bytes`.
pub fn blocks_for(bytes: usize) -> usize {
    bytes.div_ceil(BLOCK_SIZE)
}
