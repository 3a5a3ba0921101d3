//! Image inspection.

use log::debug;

use super::{ImageLayout, LayoutError, detect_layout};
use crate::flash::partition::Partition;
use crate::flash::selector::select_active;
use crate::image::counter::Counter;
use crate::image::crc32;
use crate::image::file::{FileWrapper, verify_file_wrapper};

/// Summary of a whole image file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ImageReport {
    /// Image length in bytes.
    pub image_size: usize,
    /// Size of each partition in bytes.
    pub partition_size: usize,
    /// Partition that would boot (1-based), if any.
    pub active: Option<usize>,
    /// Per-partition details.
    pub partitions: Vec<PartitionReport>,
}

impl ImageReport {
    /// Whether every partition and every file region verified.
    pub fn is_valid(&self) -> bool {
        self.partitions.iter().all(PartitionReport::is_valid)
    }
}

/// Summary of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PartitionReport {
    /// Partition number (1-based).
    pub number: usize,
    /// Byte offset of the partition within the image.
    pub offset: usize,
    /// Whether the header and region table verified.
    pub valid: bool,
    /// First verification failure.
    pub error: Option<String>,
    /// Header image version.
    pub image_version: Option<u32>,
    /// Partition size in blocks from the header.
    pub size_blocks: Option<u32>,
    /// Header checksum.
    pub header_checksum: Option<u32>,
    /// Priority counter.
    pub priority: Option<CounterReport>,
    /// Attempted-boot counter.
    pub attempted_boots: Option<CounterReport>,
    /// Completed-boot counter.
    pub completed_boots: Option<CounterReport>,
    /// Verified regions in table order.
    pub regions: Vec<RegionReport>,
}

impl PartitionReport {
    /// Whether the partition and all its file regions verified.
    pub fn is_valid(&self) -> bool {
        self.valid
            && self
                .regions
                .iter()
                .all(|r| r.file.as_ref().is_none_or(|f| f.error.is_none()))
    }
}

/// A decoded counter field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CounterReport {
    /// Decoded value.
    pub value: u32,
    /// Whether the field is corrupted.
    pub corrupted: bool,
}

impl From<&Counter> for CounterReport {
    fn from(counter: &Counter) -> Self {
        Self {
            value: counter.value(),
            corrupted: counter.is_corrupted(),
        }
    }
}

/// One region table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RegionReport {
    /// Position in the region table.
    pub index: usize,
    /// Numeric region identifier.
    pub id: u32,
    /// Region name.
    pub name: String,
    /// Offset in blocks from the partition start.
    pub offset_blocks: u32,
    /// Reserved size in blocks.
    pub size_blocks: u32,
    /// Descriptor checksum.
    pub checksum: u32,
    /// File wrapper details; `None` for control regions.
    pub file: Option<FileReport>,
}

/// File wrapper verification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileReport {
    /// Payload length, when the wrapper verified.
    pub size: Option<usize>,
    /// Wrapper checksum, when the wrapper verified.
    pub checksum: Option<u32>,
    /// CRC-32 of the payload bytes, when the wrapper verified.
    pub payload_checksum: Option<u32>,
    /// Verification failure.
    pub error: Option<String>,
}

/// Inspect every partition of `image`.
pub fn view_image(image: &[u8]) -> Result<ImageReport, LayoutError> {
    let layout = detect_layout(image)?;
    let scanned: Vec<Partition> = (0..layout.partition_count)
        .filter_map(|i| layout.partition(image, i).map(|bytes| Partition::scan(i, bytes)))
        .collect();

    let active = match scanned.as_slice() {
        [a, b] => select_active(a, b).ok().map(|s| s.active + 1),
        [only] if only.valid => Some(1),
        _ => None,
    };

    let partitions = scanned
        .iter()
        .map(|p| partition_report(&layout, image, p))
        .collect();

    Ok(ImageReport {
        image_size: image.len(),
        partition_size: layout.partition_size,
        active,
        partitions,
    })
}

fn partition_report(layout: &ImageLayout, image: &[u8], partition: &Partition) -> PartitionReport {
    let bytes = layout.partition(image, partition.index).unwrap_or_default();
    let regions = partition
        .regions
        .iter()
        .enumerate()
        .map(|(index, desc)| {
            let file = (!desc.region_id.is_control()).then(|| {
                let region = bytes.get(desc.byte_range()).unwrap_or_default();
                match verify_file_wrapper(region, desc.size_bytes()) {
                    Ok((offset, len)) => FileReport {
                        size: Some(len),
                        checksum: FileWrapper::read_from(&mut region.get(..offset).unwrap_or_default())
                            .ok()
                            .map(|w| w.checksum),
                        payload_checksum: region.get(offset..offset + len).map(crc32),
                        error: None,
                    },
                    Err(e) => {
                        debug!("Region {index} ({}): {e}", desc.region_id);
                        FileReport {
                            size: None,
                            checksum: None,
                            payload_checksum: None,
                            error: Some(e.to_string()),
                        }
                    },
                }
            });
            RegionReport {
                index,
                id: desc.region_id.as_u32(),
                name: desc.region_id.to_string(),
                offset_blocks: desc.offset_blocks,
                size_blocks: desc.size_blocks,
                checksum: desc.checksum,
                file,
            }
        })
        .collect();

    PartitionReport {
        number: partition.index + 1,
        offset: partition.index * layout.partition_size,
        valid: partition.valid,
        error: partition.error.map(|e| e.to_string()),
        image_version: partition.header.map(|h| h.image_version),
        size_blocks: partition.header.map(|h| h.partition_size_blocks),
        header_checksum: partition.header.map(|h| h.checksum),
        priority: partition.priority.as_ref().map(CounterReport::from),
        attempted_boots: partition.attempted_boots.as_ref().map(CounterReport::from),
        completed_boots: partition.completed_boots.as_ref().map(CounterReport::from),
        regions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::BLOCK_SIZE;
    use crate::image::region::RegionId;
    use crate::tool::builder::{PartitionSpec, RegionSpec, create_image};

    fn image() -> Vec<u8> {
        let mut a = PartitionSpec::new(8 * BLOCK_SIZE);
        a.priority = 1;
        a.image_version = 3;
        a.regions = vec![
            RegionSpec::with_data(RegionId::SpBl1, vec![0x11; 5000]),
            RegionSpec::with_data(RegionId::ConfigurationData, b"cfg".to_vec()),
        ];
        let mut b = a.clone();
        b.priority = 2;
        create_image(&[a, b]).unwrap()
    }

    #[test]
    fn test_view_dual_image() {
        let report = view_image(&image()).unwrap();
        assert!(report.is_valid());
        assert_eq!(report.partition_size, 8 * BLOCK_SIZE);
        assert_eq!(report.active, Some(2));
        assert_eq!(report.partitions.len(), 2);

        let first = &report.partitions[0];
        assert_eq!(first.number, 1);
        assert_eq!(first.image_version, Some(3));
        assert_eq!(
            first.priority,
            Some(CounterReport {
                value: 1,
                corrupted: false
            })
        );
        let names: Vec<_> = first.regions.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            ["PRIORITY_DESIGNATOR", "BOOT_COUNTERS", "SP_BL1", "CONFIGURATION_DATA"]
        );
        let bl1 = &first.regions[2];
        assert_eq!(bl1.size_blocks, 2);
        assert_eq!(bl1.file.as_ref().and_then(|f| f.size), Some(5000));
        assert!(first.regions[3].file.is_none());
    }

    #[test]
    fn test_view_flags_damaged_file() {
        let mut image = image();
        image[3 * BLOCK_SIZE + 8] ^= 0xFF;
        let report = view_image(&image).unwrap();
        assert!(report.partitions[0].valid);
        assert!(!report.is_valid());
        let error = report.partitions[0].regions[2].file.as_ref().unwrap().error.as_deref();
        assert!(error.unwrap().contains("checksum mismatch"));
    }

    #[test]
    fn test_view_reports_payload_crc() {
        let report = view_image(&image()).unwrap();
        let bl1 = report.partitions[0].regions[2].file.as_ref().unwrap();
        assert_eq!(bl1.payload_checksum, Some(crc32(&[0x11; 5000])));
        assert_ne!(bl1.checksum, bl1.payload_checksum);

        let mut image = image();
        image[3 * BLOCK_SIZE + 100] ^= 0xFF;
        let report = view_image(&image).unwrap();
        assert!(report.is_valid());
        let bl1 = report.partitions[0].regions[2].file.as_ref().unwrap();
        assert_ne!(bl1.payload_checksum, Some(crc32(&[0x11; 5000])));
    }

    #[test]
    fn test_view_corrupted_header() {
        let mut image = image();
        image[8 * BLOCK_SIZE + 12] ^= 0x01;
        let report = view_image(&image).unwrap();
        assert!(!report.is_valid());
        assert!(!report.partitions[1].valid);
        assert_eq!(report.active, Some(1));
    }
}
