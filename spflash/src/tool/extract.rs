//! Region extraction and replacement.

use std::fmt;

use log::{debug, info, warn};
use thiserror::Error;

use super::{LayoutError, detect_layout};
use crate::flash::partition::{Partition, ScanError};
use crate::image::BLOCK_SIZE;
use crate::image::file::{FILE_WRAPPER_SIZE, FileError, verify_file_wrapper, wrap};
use crate::image::region::{RegionDescriptor, RegionId};

/// Extraction and replacement errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// Image layout could not be determined.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Partition number outside 1..=count.
    #[error("partition {number} out of range, image has {count}")]
    PartitionNumber {
        /// Requested 1-based partition number.
        number: usize,
        /// Partitions in the image.
        count: usize,
    },

    /// The partition failed verification before reaching the region.
    #[error("partition {number} is invalid: {source}")]
    PartitionInvalid {
        /// 1-based partition number.
        number: usize,
        /// Verification failure.
        source: ScanError,
    },

    /// No region matches the selector.
    #[error("region {0} not found")]
    RegionNotFound(RegionSelector),

    /// File wrapper of the region failed verification.
    #[error("region {id}: {source}")]
    File {
        /// Region identifier.
        id: RegionId,
        /// Underlying error.
        source: FileError,
    },

    /// Replacement data does not fit in the region.
    #[error("region {id}: {len} bytes do not fit in {capacity}")]
    ReplacementTooLarge {
        /// Region identifier.
        id: RegionId,
        /// Replacement length.
        len: usize,
        /// Bytes available.
        capacity: usize,
    },
}

/// How a region is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSelector {
    /// By identifier.
    Id(RegionId),
    /// By position in the region table (0-based).
    Index(usize),
}

impl RegionSelector {
    /// Parse a command-line region argument.
    ///
    /// Region names always select by identifier. Numbers select by table
    /// index, or by identifier when `by_id` is set.
    pub fn parse(s: &str, by_id: bool) -> Option<Self> {
        if let Some(id) = RegionId::from_name(s.trim()) {
            return Some(Self::Id(id));
        }
        if by_id {
            return RegionId::parse(s).map(Self::Id);
        }
        let s = s.trim();
        let index = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => usize::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        };
        index.map(Self::Index)
    }
}

impl fmt::Display for RegionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id} ({:#x})", id.as_u32()),
            Self::Index(i) => write!(f, "#{i}"),
        }
    }
}

/// A region located inside an image.
struct Located {
    desc: RegionDescriptor,
    /// Byte offset of the region within the whole image.
    start: usize,
}

fn locate(image: &[u8], number: usize, selector: RegionSelector) -> Result<Located, ExtractError> {
    let layout = detect_layout(image)?;
    let index = number
        .checked_sub(1)
        .filter(|&i| i < layout.partition_count)
        .ok_or(ExtractError::PartitionNumber {
            number,
            count: layout.partition_count,
        })?;
    let bytes = layout
        .partition(image, index)
        .ok_or(ExtractError::PartitionNumber {
            number,
            count: layout.partition_count,
        })?;

    let partition = Partition::scan(index, bytes);
    let found = match selector {
        RegionSelector::Id(id) => partition.find_region(id),
        RegionSelector::Index(i) => partition.regions.get(i),
    };
    let desc = match (found, partition.error) {
        (Some(desc), _) => *desc,
        (None, Some(source)) => return Err(ExtractError::PartitionInvalid { number, source }),
        (None, None) => return Err(ExtractError::RegionNotFound(selector)),
    };

    debug!(
        "Partition {number}: {} at block {} ({} blocks)",
        desc.region_id, desc.offset_blocks, desc.size_blocks
    );
    Ok(Located {
        desc,
        start: index * layout.partition_size + desc.offset_bytes(),
    })
}

/// Contents of one region.
///
/// Control regions yield their raw block; file regions yield the payload of
/// their verified wrapper. `number` is the 1-based partition number.
pub fn extract_region(
    image: &[u8],
    number: usize,
    selector: RegionSelector,
) -> Result<Vec<u8>, ExtractError> {
    let located = locate(image, number, selector)?;
    region_contents(image, &located)
}

fn region_contents(image: &[u8], located: &Located) -> Result<Vec<u8>, ExtractError> {
    let id = located.desc.region_id;
    let size = located.desc.size_bytes();
    let region = &image[located.start..located.start + size];
    if id.is_control() {
        return Ok(region[..BLOCK_SIZE.min(size)].to_vec());
    }
    let (offset, len) =
        verify_file_wrapper(region, size).map_err(|source| ExtractError::File { id, source })?;
    Ok(region[offset..offset + len].to_vec())
}

/// An extracted region with its suggested file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRegion {
    /// 1-based partition number.
    pub partition: usize,
    /// Position in the region table.
    pub index: usize,
    /// Region identifier.
    pub id: RegionId,
    /// File name, `p<partition>_<index>_<NAME>.bin`.
    pub file_name: String,
    /// Region contents.
    pub data: Vec<u8>,
}

/// Extract every region of every partition.
///
/// Regions whose contents cannot be extracted are skipped with a log line;
/// a partition whose header is unusable contributes nothing.
pub fn extract_all(image: &[u8]) -> Result<Vec<ExtractedRegion>, ExtractError> {
    let layout = detect_layout(image)?;
    let mut out = Vec::new();

    for index in 0..layout.partition_count {
        let Some(bytes) = layout.partition(image, index) else {
            continue;
        };
        let number = index + 1;
        let partition = Partition::scan(index, bytes);
        if let Some(e) = partition.error {
            info!("Partition {number}: {e}");
        }

        for (i, desc) in partition.regions.iter().enumerate() {
            let located = Located {
                desc: *desc,
                start: index * layout.partition_size + desc.offset_bytes(),
            };
            match region_contents(image, &located) {
                Ok(data) => out.push(ExtractedRegion {
                    partition: number,
                    index: i,
                    id: desc.region_id,
                    file_name: format!("p{number}_{i}_{}.bin", desc.region_id),
                    data,
                }),
                Err(e) => warn!("Partition {number}: skipping region {i}: {e}"),
            }
        }
    }
    Ok(out)
}

/// Copy of `image` with one region's contents replaced.
///
/// File regions are re-wrapped around `data`; control regions receive
/// `data` raw at the start of their erased block.
pub fn replace_region(
    image: &[u8],
    number: usize,
    selector: RegionSelector,
    data: &[u8],
) -> Result<Vec<u8>, ExtractError> {
    let located = locate(image, number, selector)?;
    let id = located.desc.region_id;
    let size = located.desc.size_bytes();

    let content = if id.is_control() {
        if data.len() > BLOCK_SIZE {
            return Err(ExtractError::ReplacementTooLarge {
                id,
                len: data.len(),
                capacity: BLOCK_SIZE,
            });
        }
        data.to_vec()
    } else {
        if data.len() + FILE_WRAPPER_SIZE > size {
            return Err(ExtractError::ReplacementTooLarge {
                id,
                len: data.len(),
                capacity: size.saturating_sub(FILE_WRAPPER_SIZE),
            });
        }
        wrap(data)
    };

    let mut out = image.to_vec();
    let region = &mut out[located.start..located.start + size];
    region.fill(0xFF);
    region[..content.len()].copy_from_slice(&content);
    debug!("Replaced {id} with {} bytes", data.len());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::builder::{PartitionSpec, RegionSpec, create_image};
    use crate::tool::view::view_image;

    fn payload() -> Vec<u8> {
        (0..5000u32).map(|i| (i % 251) as u8).collect()
    }

    fn image() -> Vec<u8> {
        let mut a = PartitionSpec::new(16 * BLOCK_SIZE);
        a.regions = vec![
            RegionSpec::with_data(RegionId::SpBl1, payload()),
            RegionSpec::with_data(RegionId::SpBl2, b"second stage".to_vec()),
            RegionSpec::with_data(RegionId::ConfigurationData, b"cfg".to_vec()),
        ];
        let mut b = a.clone();
        b.regions[1] = RegionSpec::with_data(RegionId::SpBl2, b"other".to_vec());
        create_image(&[a, b]).unwrap()
    }

    #[test]
    fn test_extract_returns_created_bytes() {
        let image = image();
        assert_eq!(
            extract_region(&image, 1, RegionSelector::Id(RegionId::SpBl1)).unwrap(),
            payload()
        );
        assert_eq!(
            extract_region(&image, 2, RegionSelector::Id(RegionId::SpBl2)).unwrap(),
            b"other"
        );
        assert_eq!(
            extract_region(&image, 1, RegionSelector::Index(3)).unwrap(),
            b"second stage"
        );
    }

    #[test]
    fn test_extract_control_region_is_raw_block() {
        let data = extract_region(&image(), 1, RegionSelector::Id(RegionId::ConfigurationData)).unwrap();
        assert_eq!(data.len(), BLOCK_SIZE);
        assert_eq!(&data[..3], b"cfg");
        assert!(data[3..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_extract_errors() {
        let image = image();
        assert_eq!(
            extract_region(&image, 3, RegionSelector::Index(0)),
            Err(ExtractError::PartitionNumber { number: 3, count: 2 })
        );
        assert_eq!(
            extract_region(&image, 0, RegionSelector::Index(0)),
            Err(ExtractError::PartitionNumber { number: 0, count: 2 })
        );
        assert_eq!(
            extract_region(&image, 1, RegionSelector::Id(RegionId::WorkerMinion)),
            Err(ExtractError::RegionNotFound(RegionSelector::Id(RegionId::WorkerMinion)))
        );
        assert!(matches!(
            extract_region(&image, 1, RegionSelector::Index(99)),
            Err(ExtractError::RegionNotFound(_))
        ));
    }

    #[test]
    fn test_extract_all_names() {
        let regions = extract_all(&image()).unwrap();
        assert_eq!(regions.len(), 10);
        assert_eq!(regions[2].file_name, "p1_2_SP_BL1.bin");
        assert_eq!(regions[2].data, payload());
        assert_eq!(regions[8].file_name, "p2_3_SP_BL2.bin");
        assert_eq!(regions[8].data, b"other");
    }

    #[test]
    fn test_replace_file_region() {
        let image = image();
        let replaced =
            replace_region(&image, 2, RegionSelector::Id(RegionId::SpBl1), b"patched").unwrap();
        assert!(view_image(&replaced).unwrap().is_valid());
        assert_eq!(
            extract_region(&replaced, 2, RegionSelector::Id(RegionId::SpBl1)).unwrap(),
            b"patched"
        );
        assert_eq!(replaced[..16 * BLOCK_SIZE], image[..16 * BLOCK_SIZE]);
    }

    #[test]
    fn test_replace_rejects_oversized() {
        let result = replace_region(
            &image(),
            1,
            RegionSelector::Id(RegionId::SpBl2),
            &[0u8; BLOCK_SIZE],
        );
        assert_eq!(
            result,
            Err(ExtractError::ReplacementTooLarge {
                id: RegionId::SpBl2,
                len: BLOCK_SIZE,
                capacity: BLOCK_SIZE - FILE_WRAPPER_SIZE
            })
        );
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!(
            RegionSelector::parse("sp_bl1", false),
            Some(RegionSelector::Id(RegionId::SpBl1))
        );
        assert_eq!(RegionSelector::parse("7", false), Some(RegionSelector::Index(7)));
        assert_eq!(
            RegionSelector::parse("0x07", true),
            Some(RegionSelector::Id(RegionId::SpBl1))
        );
        assert_eq!(RegionSelector::parse("nope", false), None);
    }
}
