//! Partition header codec.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::region::REGION_INFO_SIZE;
use super::{BLOCK_SIZE, PARTITION_MAGIC, crc32};

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// Value of the reserved header field.
pub const RESERVED_SENTINEL: u32 = 0xFFFF_FFFF;

/// Largest region table that fits next to the header in block 0.
pub const MAX_REGIONS: usize = (BLOCK_SIZE - HEADER_SIZE) / REGION_INFO_SIZE;

/// Offset of the checksum field; the checksum covers everything before it.
const CHECKSUM_OFFSET: usize = HEADER_SIZE - 4;

/// Header verification errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Fewer bytes than a header were supplied.
    #[error("header truncated: {len} bytes, need 32")]
    Truncated {
        /// Bytes available.
        len: usize,
    },

    /// The header block is erased; no partition was ever written here.
    #[error("header block is erased")]
    Erased,

    /// Checksum does not match the header contents.
    #[error("header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the header.
        stored: u32,
        /// Checksum computed over the header bytes.
        computed: u32,
    },

    /// Magic tag is not [`PARTITION_MAGIC`].
    #[error("bad partition tag {0:#010x}")]
    BadTag(u32),

    /// Declared header size does not match the encoded layout.
    #[error("bad header size {0}")]
    BadHeaderSize(u32),

    /// Declared region descriptor size does not match the encoded layout.
    #[error("bad region info size {0}")]
    BadRegionInfoSize(u32),

    /// Reserved field is not the all-ones sentinel.
    #[error("bad reserved field {0:#010x}")]
    BadReserved(u32),

    /// Region table does not fit in the header block.
    #[error("too many regions: {count} (max 254)")]
    TooManyRegions {
        /// Declared region count.
        count: u32,
    },

    /// Declared partition size differs from the space actually available.
    #[error("partition size mismatch: header declares {declared} blocks, found {actual}")]
    SizeMismatch {
        /// Blocks declared in the header.
        declared: u32,
        /// Blocks actually present.
        actual: usize,
    },
}

impl HeaderError {
    /// Whether the error means "no partition here" rather than "damaged".
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Erased)
    }
}

/// Partition header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PartitionHeader {
    /// Magic tag.
    pub tag: u32,
    /// Header size in bytes.
    pub header_size: u32,
    /// Partition size in blocks, header block included.
    pub partition_size_blocks: u32,
    /// Image version.
    pub image_version: u32,
    /// Size of one region descriptor in bytes.
    pub region_info_size: u32,
    /// Number of region descriptors following the header.
    pub regions_count: u32,
    /// Reserved, always [`RESERVED_SENTINEL`].
    pub reserved: u32,
    /// CRC-32 over the preceding fields.
    pub checksum: u32,
}

impl PartitionHeader {
    /// Build a sealed header.
    pub fn new(partition_size_blocks: u32, image_version: u32, regions_count: u32) -> Self {
        let mut header = Self {
            tag: PARTITION_MAGIC,
            header_size: HEADER_SIZE as u32,
            partition_size_blocks,
            image_version,
            region_info_size: REGION_INFO_SIZE as u32,
            regions_count,
            reserved: RESERVED_SENTINEL,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    /// Read a header from a reader without validating it.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            tag: reader.read_u32::<LittleEndian>()?,
            header_size: reader.read_u32::<LittleEndian>()?,
            partition_size_blocks: reader.read_u32::<LittleEndian>()?,
            image_version: reader.read_u32::<LittleEndian>()?,
            region_info_size: reader.read_u32::<LittleEndian>()?,
            regions_count: reader.read_u32::<LittleEndian>()?,
            reserved: reader.read_u32::<LittleEndian>()?,
            checksum: reader.read_u32::<LittleEndian>()?,
        })
    }

    /// Encode the header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u32_into(
            &[
                self.tag,
                self.header_size,
                self.partition_size_blocks,
                self.image_version,
                self.region_info_size,
                self.regions_count,
                self.reserved,
                self.checksum,
            ],
            &mut buf,
        );
        buf
    }

    /// Checksum the header fields as currently set.
    pub fn compute_checksum(&self) -> u32 {
        crc32(&self.to_bytes()[..CHECKSUM_OFFSET])
    }

    /// Partition size in bytes.
    pub fn partition_size_bytes(&self) -> usize {
        self.partition_size_blocks as usize * BLOCK_SIZE
    }
}

/// Decode and verify a partition header.
///
/// An all-ones header is reported as [`HeaderError::Erased`]. Otherwise the
/// checksum is verified before any individual field, so corruption anywhere
/// in the covered range surfaces as [`HeaderError::ChecksumMismatch`].
pub fn verify_header(bytes: &[u8]) -> Result<PartitionHeader, HeaderError> {
    let Some(raw) = bytes.get(..HEADER_SIZE) else {
        return Err(HeaderError::Truncated { len: bytes.len() });
    };
    if raw.iter().all(|&b| b == 0xFF) {
        return Err(HeaderError::Erased);
    }

    let header = PartitionHeader::read_from(&mut &raw[..])
        .map_err(|_| HeaderError::Truncated { len: bytes.len() })?;

    let computed = header.compute_checksum();
    if computed != header.checksum {
        return Err(HeaderError::ChecksumMismatch {
            stored: header.checksum,
            computed,
        });
    }
    if header.tag != PARTITION_MAGIC {
        return Err(HeaderError::BadTag(header.tag));
    }
    if header.header_size as usize != HEADER_SIZE {
        return Err(HeaderError::BadHeaderSize(header.header_size));
    }
    if header.region_info_size as usize != REGION_INFO_SIZE {
        return Err(HeaderError::BadRegionInfoSize(header.region_info_size));
    }
    if header.reserved != RESERVED_SENTINEL {
        return Err(HeaderError::BadReserved(header.reserved));
    }
    if header.regions_count as usize > MAX_REGIONS {
        return Err(HeaderError::TooManyRegions {
            count: header.regions_count,
        });
    }

    Ok(header)
}
