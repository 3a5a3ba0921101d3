//! File wrapper stored at the start of generic regions.
//!
//! Regions are reserved in whole blocks, so the wrapper records the true
//! payload length:
//!
//! ```text
//! +----------------------+
//! | tag         (4B)     |
//! | header_size (4B)     |
//! | payload_size(4B)     |
//! | checksum    (4B)     |  CRC-32 over the 12 bytes above
//! +----------------------+
//! | payload              |
//! +----------------------+
//! ```

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::{FILE_MAGIC, crc32};

/// Encoded wrapper header size in bytes.
pub const FILE_WRAPPER_SIZE: usize = 16;

const CHECKSUM_OFFSET: usize = FILE_WRAPPER_SIZE - 4;

/// File wrapper errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileError {
    /// Not enough bytes for the wrapper header or its payload.
    #[error("file data truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// Magic tag is not [`FILE_MAGIC`].
    #[error("bad file tag {0:#010x}")]
    BadTag(u32),

    /// Declared header size does not match the encoded layout.
    #[error("bad file header size {0}")]
    BadHeaderSize(u32),

    /// Payload does not fit in the region.
    #[error("file payload of {payload_size} bytes exceeds region capacity of {capacity}")]
    PayloadTooLarge {
        /// Declared payload size.
        payload_size: usize,
        /// Bytes available for payload.
        capacity: usize,
    },

    /// Checksum mismatch over the wrapper header.
    #[error("file checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the wrapper.
        stored: u32,
        /// Checksum computed over the wrapper header.
        computed: u32,
    },
}

/// File wrapper header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileWrapper {
    /// Magic tag.
    pub tag: u32,
    /// Wrapper header size in bytes.
    pub header_size: u32,
    /// Payload size in bytes.
    pub payload_size: u32,
    /// CRC-32 over the preceding fields. The payload is not covered.
    pub checksum: u32,
}

impl FileWrapper {
    /// Build a sealed wrapper header for `payload`.
    pub fn for_payload(payload: &[u8]) -> Self {
        let mut wrapper = Self {
            tag: FILE_MAGIC,
            header_size: FILE_WRAPPER_SIZE as u32,
            payload_size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            checksum: 0,
        };
        wrapper.checksum = wrapper.compute_checksum();
        wrapper
    }

    /// Read a wrapper header without validating it.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            tag: reader.read_u32::<LittleEndian>()?,
            header_size: reader.read_u32::<LittleEndian>()?,
            payload_size: reader.read_u32::<LittleEndian>()?,
            checksum: reader.read_u32::<LittleEndian>()?,
        })
    }

    /// Encode the wrapper header.
    pub fn to_bytes(&self) -> [u8; FILE_WRAPPER_SIZE] {
        let mut buf = [0u8; FILE_WRAPPER_SIZE];
        LittleEndian::write_u32_into(
            &[self.tag, self.header_size, self.payload_size, self.checksum],
            &mut buf,
        );
        buf
    }

    /// Checksum the tag and size fields.
    pub fn compute_checksum(&self) -> u32 {
        crc32(&self.to_bytes()[..CHECKSUM_OFFSET])
    }
}

/// Wrap `payload`, returning the header followed by the payload.
pub fn wrap(payload: &[u8]) -> Vec<u8> {
    let wrapper = FileWrapper::for_payload(payload);
    let mut out = Vec::with_capacity(FILE_WRAPPER_SIZE + payload.len());
    out.extend_from_slice(&wrapper.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Verify the wrapper at the start of `bytes`.
///
/// `region_reserved_bytes` is the reserved size of the enclosing region.
/// Returns the payload offset and length within `bytes`.
pub fn verify_file_wrapper(
    bytes: &[u8],
    region_reserved_bytes: usize,
) -> Result<(usize, usize), FileError> {
    let Some(mut raw) = bytes.get(..FILE_WRAPPER_SIZE) else {
        return Err(FileError::Truncated {
            needed: FILE_WRAPPER_SIZE,
            available: bytes.len(),
        });
    };
    let wrapper = FileWrapper::read_from(&mut raw).map_err(|_| FileError::Truncated {
        needed: FILE_WRAPPER_SIZE,
        available: bytes.len(),
    })?;

    if wrapper.tag != FILE_MAGIC {
        return Err(FileError::BadTag(wrapper.tag));
    }
    if wrapper.header_size as usize != FILE_WRAPPER_SIZE {
        return Err(FileError::BadHeaderSize(wrapper.header_size));
    }

    let payload_len = wrapper.payload_size as usize;
    let capacity = region_reserved_bytes.saturating_sub(FILE_WRAPPER_SIZE);
    if payload_len > capacity {
        return Err(FileError::PayloadTooLarge {
            payload_size: payload_len,
            capacity,
        });
    }

    let end = FILE_WRAPPER_SIZE + payload_len;
    if bytes.len() < end {
        return Err(FileError::Truncated {
            needed: end,
            available: bytes.len(),
        });
    }

    let computed = wrapper.compute_checksum();
    if computed != wrapper.checksum {
        return Err(FileError::ChecksumMismatch {
            stored: wrapper.checksum,
            computed,
        });
    }

    Ok((FILE_WRAPPER_SIZE, payload_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_layout() {
        let wrapped = wrap(b"hello");
        assert_eq!(wrapped.len(), FILE_WRAPPER_SIZE + 5);
        assert_eq!(&wrapped[0..4], b"FILE");
        assert_eq!(LittleEndian::read_u32(&wrapped[4..8]), 16);
        assert_eq!(LittleEndian::read_u32(&wrapped[8..12]), 5);
        assert_eq!(&wrapped[16..], b"hello");
    }

    #[test]
    fn test_verify_wrapped_payload() {
        let mut region = wrap(b"payload bytes");
        region.resize(4096, 0xFF);
        let (offset, len) = verify_file_wrapper(&region, 4096).unwrap();
        assert_eq!(&region[offset..offset + len], b"payload bytes");
    }

    #[test]
    fn test_verify_empty_payload() {
        let region = wrap(&[]);
        assert_eq!(verify_file_wrapper(&region, 4096), Ok((16, 0)));
    }

    #[test]
    fn test_checksum_known_vectors() {
        let wrapped = wrap(b"hello");
        assert_eq!(
            &wrapped[..12],
            &[0x46, 0x49, 0x4C, 0x45, 0x10, 0, 0, 0, 0x05, 0, 0, 0]
        );
        assert_eq!(LittleEndian::read_u32(&wrapped[12..16]), 0x5268_936A);
        assert_eq!(FileWrapper::for_payload(&[]).checksum, 0x65B6_6358);
    }

    #[test]
    fn test_checksum_ignores_payload_bytes() {
        let a = FileWrapper::for_payload(b"hello");
        let b = FileWrapper::for_payload(b"world");
        assert_eq!(a.checksum, b.checksum);

        let mut region = wrap(b"payload bytes");
        region[20] ^= 0x80;
        assert_eq!(verify_file_wrapper(&region, 4096), Ok((16, 13)));
    }

    #[test]
    fn test_verify_detects_header_corruption() {
        let mut region = wrap(b"payload bytes");
        region[8] ^= 0x01;
        assert!(matches!(
            verify_file_wrapper(&region, 4096),
            Err(FileError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_truncated_payload() {
        let region = wrap(b"payload bytes");
        assert_eq!(
            verify_file_wrapper(&region[..20], 4096),
            Err(FileError::Truncated {
                needed: 29,
                available: 20
            })
        );
    }

    #[test]
    fn test_verify_rejects_oversized_payload() {
        let region = wrap(&[0u8; 100]);
        assert_eq!(
            verify_file_wrapper(&region, 64),
            Err(FileError::PayloadTooLarge {
                payload_size: 100,
                capacity: 48
            })
        );
    }

    #[test]
    fn test_verify_rejects_erased_region() {
        assert_eq!(
            verify_file_wrapper(&[0xFF; 4096], 4096),
            Err(FileError::BadTag(0xFFFF_FFFF))
        );
        assert!(matches!(
            verify_file_wrapper(&[0u8; 8], 4096),
            Err(FileError::Truncated { .. })
        ));
    }
}
