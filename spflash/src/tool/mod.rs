//! Host-side image tool.
//!
//! Image files hold either a single partition or a full two-partition flash
//! image. The partition size is taken from the first header, so the file
//! length decides which of the two it is.

pub mod builder;
pub mod extract;
pub mod view;

use std::path::Path;

use log::debug;
use thiserror::Error;

use crate::error::Result;
use crate::image::BLOCK_SIZE;
use crate::image::header::{HEADER_SIZE, PartitionHeader};

/// Image layout detection errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// Image length is not a whole number of blocks.
    #[error("image size {0} is not a multiple of 4096 bytes")]
    NotBlockAligned(usize),

    /// Image is too short to contain a header.
    #[error("image is empty")]
    Empty,

    /// The first header declares a zero partition size.
    #[error("first partition header declares no size")]
    NoPartitionSize,

    /// Length matches neither one nor two partitions.
    #[error("image size {image_len} is not one or two partitions of {partition_size} bytes")]
    SizeMismatch {
        /// Image length in bytes.
        image_len: usize,
        /// Partition size from the first header.
        partition_size: usize,
    },
}

/// How an image file splits into partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// Size of each partition in bytes.
    pub partition_size: usize,
    /// Number of partitions (1 or 2).
    pub partition_count: usize,
}

impl ImageLayout {
    /// Bytes of partition `index` (0-based).
    pub fn partition<'a>(&self, image: &'a [u8], index: usize) -> Option<&'a [u8]> {
        if index >= self.partition_count {
            return None;
        }
        image.get(index * self.partition_size..(index + 1) * self.partition_size)
    }
}

/// Work out the partition layout of `image` from its length and first header.
///
/// The header is read without verification; callers scan each partition
/// afterwards.
pub fn detect_layout(image: &[u8]) -> std::result::Result<ImageLayout, LayoutError> {
    if image.len() < HEADER_SIZE {
        return Err(LayoutError::Empty);
    }
    if image.len() % BLOCK_SIZE != 0 {
        return Err(LayoutError::NotBlockAligned(image.len()));
    }

    let mut raw = &image[..HEADER_SIZE];
    let header = PartitionHeader::read_from(&mut raw).map_err(|_| LayoutError::Empty)?;
    let partition_size = header.partition_size_bytes();
    if partition_size == 0 {
        return Err(LayoutError::NoPartitionSize);
    }

    let partition_count = if image.len() == partition_size {
        1
    } else if Some(image.len()) == partition_size.checked_mul(2) {
        2
    } else {
        return Err(LayoutError::SizeMismatch {
            image_len: image.len(),
            partition_size,
        });
    };

    debug!("Image layout: {partition_count} x {partition_size} bytes");
    Ok(ImageLayout {
        partition_size,
        partition_count,
    })
}

/// Read an image file and detect its layout.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<(Vec<u8>, ImageLayout)> {
    let path = path.as_ref();
    let image = std::fs::read(path)?;
    debug!("Loaded {} ({} bytes)", path.display(), image.len());
    let layout = detect_layout(&image)?;
    Ok((image, layout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::builder::{PartitionSpec, create_image};

    #[test]
    fn test_detect_single_and_dual() {
        let spec = PartitionSpec::new(4 * BLOCK_SIZE);
        let single = create_image(std::slice::from_ref(&spec)).unwrap();
        assert_eq!(
            detect_layout(&single),
            Ok(ImageLayout {
                partition_size: 4 * BLOCK_SIZE,
                partition_count: 1
            })
        );

        let dual = create_image(&[spec.clone(), spec]).unwrap();
        let layout = detect_layout(&dual).unwrap();
        assert_eq!(layout.partition_count, 2);
        assert_eq!(layout.partition(&dual, 1), Some(&dual[4 * BLOCK_SIZE..]));
        assert_eq!(layout.partition(&dual, 2), None);
    }

    #[test]
    fn test_load_image_reports_layout_errors() {
        let dir = std::env::temp_dir().join(format!("spflash-layout-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("short.bin");
        std::fs::write(&path, [0u8; 100]).unwrap();
        assert!(matches!(
            load_image(&path),
            Err(crate::Error::Layout(LayoutError::NotBlockAligned(100)))
        ));
        assert!(matches!(load_image(dir.join("missing.bin")), Err(crate::Error::Io(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_detect_rejects_odd_sizes() {
        assert_eq!(detect_layout(&[0u8; 100]), Err(LayoutError::NotBlockAligned(100)));
        assert_eq!(detect_layout(&[]), Err(LayoutError::Empty));

        let mut image = create_image(&[PartitionSpec::new(4 * BLOCK_SIZE)]).unwrap();
        image.extend([0xFF; BLOCK_SIZE]);
        assert_eq!(
            detect_layout(&image),
            Err(LayoutError::SizeMismatch {
                image_len: 5 * BLOCK_SIZE,
                partition_size: 4 * BLOCK_SIZE
            })
        );
    }
}
