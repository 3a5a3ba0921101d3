//! Image creation.
//!
//! A partition is laid out from its header block onwards: the priority
//! designator and boot counters come first (reserved automatically when the
//! caller does not list them), then every other region in the order given.
//! Regions are packed contiguously from block 1 and the remainder of the
//! partition stays erased.

use log::debug;
use thiserror::Error;

use crate::image::counter::{BOOT_COUNTER_SIZE, CounterError, encode_increment};
use crate::image::file::{FILE_WRAPPER_SIZE, wrap};
use crate::image::header::{HEADER_SIZE, MAX_REGIONS, PartitionHeader};
use crate::image::region::{REGION_INFO_SIZE, RegionDescriptor, RegionId};
use crate::image::{BLOCK_SIZE, blocks_for};

/// Image creation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// No partition was described.
    #[error("no partitions to build")]
    NoPartitions,

    /// More than two partitions were described.
    #[error("{0} partitions given, an image holds at most 2")]
    TooManyPartitions(usize),

    /// Partition size is zero or not a multiple of the block size.
    #[error("partition size {0} is not a non-zero multiple of 4096")]
    PartitionSizeNotAligned(usize),

    /// The two partitions differ in size.
    #[error("partition sizes differ: {first} and {second} bytes")]
    PartitionSizeMismatch {
        /// First partition size.
        first: usize,
        /// Second partition size.
        second: usize,
    },

    /// Region identifier is 0 or beyond the accepted range.
    #[error("invalid region id {0}")]
    InvalidRegionId(RegionId),

    /// Region listed twice.
    #[error("region {0} listed more than once")]
    DuplicateRegion(RegionId),

    /// Explicit region size is zero or not a block multiple.
    #[error("region {id}: size {size} is not a non-zero multiple of 4096")]
    RegionSizeNotAligned {
        /// Region identifier.
        id: RegionId,
        /// Requested size in bytes.
        size: usize,
    },

    /// Control region given a size other than one block.
    #[error("region {id}: control regions are one block, got {size} bytes")]
    ControlRegionSize {
        /// Region identifier.
        id: RegionId,
        /// Requested size in bytes.
        size: usize,
    },

    /// Control region content larger than one block.
    #[error("region {id}: {len} bytes of data do not fit in one block")]
    ControlDataTooLarge {
        /// Region identifier.
        id: RegionId,
        /// Data length.
        len: usize,
    },

    /// Wrapped file larger than the region.
    #[error("region {id}: file of {len} bytes does not fit in {capacity} bytes")]
    FileTooLarge {
        /// Region identifier.
        id: RegionId,
        /// Payload length.
        len: usize,
        /// Payload capacity of the region.
        capacity: usize,
    },

    /// Regions do not fit in the partition.
    #[error("region {id} ends at block {end}, partition has {partition_blocks} blocks")]
    LayoutOverflow {
        /// First region that does not fit.
        id: RegionId,
        /// Block just past that region.
        end: usize,
        /// Partition size in blocks.
        partition_blocks: usize,
    },

    /// Region table does not fit in the header block.
    #[error("{0} regions, at most 254 fit in the header block")]
    TooManyRegions(usize),

    /// A counter cannot hold the requested starting value.
    #[error("region {id}: {source}")]
    Counter {
        /// Counter region.
        id: RegionId,
        /// Underlying error.
        source: CounterError,
    },
}

/// One region to place in a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    /// Region identifier.
    pub id: RegionId,
    /// Reserved size in bytes; computed from the data when absent.
    pub size_bytes: Option<usize>,
    /// Region content. File regions are wrapped, control regions copied raw.
    pub data: Option<Vec<u8>>,
}

impl RegionSpec {
    /// Empty region of default size.
    pub fn new(id: RegionId) -> Self {
        Self {
            id,
            size_bytes: None,
            data: None,
        }
    }

    /// Region holding `data`.
    pub fn with_data(id: RegionId, data: Vec<u8>) -> Self {
        Self {
            id,
            size_bytes: None,
            data: Some(data),
        }
    }

    /// Reserve `size_bytes` instead of the computed size.
    #[must_use]
    pub fn with_size(mut self, size_bytes: usize) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }
}

/// One partition to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Partition size in bytes, header block included.
    pub size_bytes: usize,
    /// Header image version.
    pub image_version: u32,
    /// Initial priority counter.
    pub priority: u32,
    /// Initial attempted-boot counter.
    pub attempted_boot_count: u32,
    /// Initial completed-boot counter.
    pub completed_boot_count: u32,
    /// Regions in layout order.
    pub regions: Vec<RegionSpec>,
}

impl PartitionSpec {
    /// Partition of `size_bytes` with no regions and zeroed counters.
    pub fn new(size_bytes: usize) -> Self {
        Self {
            size_bytes,
            image_version: 0,
            priority: 0,
            attempted_boot_count: 0,
            completed_boot_count: 0,
            regions: Vec::new(),
        }
    }
}

/// A region with its final placement.
struct Placed<'a> {
    desc: RegionDescriptor,
    data: Option<&'a [u8]>,
}

/// Lays regions out one after another in a partition buffer.
struct PartitionBuilder<'a> {
    partition_blocks: usize,
    next_block: usize,
    placed: Vec<Placed<'a>>,
}

impl<'a> PartitionBuilder<'a> {
    fn new(partition_blocks: usize) -> Self {
        Self {
            partition_blocks,
            next_block: 1,
            placed: Vec::new(),
        }
    }

    fn place(&mut self, region: &'a RegionSpec) -> Result<(), BuildError> {
        let id = region.id;
        if !id.is_valid() {
            return Err(BuildError::InvalidRegionId(id));
        }
        if self.placed.iter().any(|p| p.desc.region_id == id) {
            return Err(BuildError::DuplicateRegion(id));
        }
        if self.placed.len() == MAX_REGIONS {
            return Err(BuildError::TooManyRegions(self.placed.len() + 1));
        }

        let data = region.data.as_deref();
        let data_len = data.map_or(0, <[u8]>::len);
        let blocks = if id.is_control() {
            if let Some(size) = region.size_bytes.filter(|&s| s != BLOCK_SIZE) {
                return Err(BuildError::ControlRegionSize { id, size });
            }
            if data_len > BLOCK_SIZE {
                return Err(BuildError::ControlDataTooLarge { id, len: data_len });
            }
            1
        } else {
            let size = match region.size_bytes {
                Some(size) if size == 0 || size % BLOCK_SIZE != 0 => {
                    return Err(BuildError::RegionSizeNotAligned { id, size });
                },
                Some(size) => size,
                None => blocks_for(data_len + FILE_WRAPPER_SIZE) * BLOCK_SIZE,
            };
            if data_len + FILE_WRAPPER_SIZE > size {
                return Err(BuildError::FileTooLarge {
                    id,
                    len: data_len,
                    capacity: size - FILE_WRAPPER_SIZE.min(size),
                });
            }
            size / BLOCK_SIZE
        };

        let end = self.next_block + blocks;
        if end > self.partition_blocks {
            return Err(BuildError::LayoutOverflow {
                id,
                end,
                partition_blocks: self.partition_blocks,
            });
        }

        // Both fit in u32 because the partition size does.
        let desc = RegionDescriptor::new(id, self.next_block as u32, blocks as u32);
        debug!("Placing {id} at block {} ({blocks} blocks)", self.next_block);
        self.placed.push(Placed { desc, data });
        self.next_block = end;
        Ok(())
    }
}

/// Build the bytes of one partition.
pub fn build_partition(spec: &PartitionSpec) -> Result<Vec<u8>, BuildError> {
    let size = spec.size_bytes;
    let partition_blocks = size / BLOCK_SIZE;
    if size == 0 || size % BLOCK_SIZE != 0 || u32::try_from(partition_blocks).is_err() {
        return Err(BuildError::PartitionSizeNotAligned(size));
    }

    let priority = RegionSpec::new(RegionId::PriorityDesignator);
    let boot_counters = RegionSpec::new(RegionId::BootCounters);
    let find = |id: RegionId| spec.regions.iter().find(|r| r.id == id);

    let mut builder = PartitionBuilder::new(partition_blocks);
    builder.place(find(RegionId::PriorityDesignator).unwrap_or(&priority))?;
    builder.place(find(RegionId::BootCounters).unwrap_or(&boot_counters))?;
    let mut seen_priority = false;
    let mut seen_boot = false;
    for region in &spec.regions {
        // The first listing of each counter region was placed above.
        let first_listing = match region.id {
            RegionId::PriorityDesignator => !std::mem::replace(&mut seen_priority, true),
            RegionId::BootCounters => !std::mem::replace(&mut seen_boot, true),
            _ => false,
        };
        if !first_listing {
            builder.place(region)?;
        }
    }

    let mut out = vec![0xFF; size];
    let header = PartitionHeader::new(
        partition_blocks as u32,
        spec.image_version,
        builder.placed.len() as u32,
    );
    out[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

    for (i, placed) in builder.placed.iter().enumerate() {
        let at = HEADER_SIZE + i * REGION_INFO_SIZE;
        out[at..at + REGION_INFO_SIZE].copy_from_slice(&placed.desc.to_bytes());

        let start = placed.desc.offset_bytes();
        let content = if placed.desc.region_id.is_control() {
            placed.data.map(<[u8]>::to_vec).unwrap_or_default()
        } else {
            wrap(placed.data.unwrap_or_default())
        };
        out[start..start + content.len()].copy_from_slice(&content);
    }

    seed_counters(&mut out, &builder.placed, spec)?;
    debug!(
        "Built partition: {partition_blocks} blocks, {} regions, {} blocks used",
        builder.placed.len(),
        builder.next_block
    );
    Ok(out)
}

/// Program the initial counter values on top of whatever the regions hold.
fn seed_counters(out: &mut [u8], placed: &[Placed<'_>], spec: &PartitionSpec) -> Result<(), BuildError> {
    let mut seed = |id: RegionId, start: usize, len: usize, value: u32| {
        let field = &mut out[start..start + len];
        let bytes = encode_increment(field, value).map_err(|source| BuildError::Counter { id, source })?;
        field.copy_from_slice(&bytes);
        Ok::<(), BuildError>(())
    };

    for p in placed {
        let start = p.desc.offset_bytes();
        match p.desc.region_id {
            RegionId::PriorityDesignator => {
                seed(RegionId::PriorityDesignator, start, BLOCK_SIZE, spec.priority)?;
            },
            RegionId::BootCounters => {
                let id = RegionId::BootCounters;
                seed(id, start, BOOT_COUNTER_SIZE, spec.attempted_boot_count)?;
                seed(
                    id,
                    start + BOOT_COUNTER_SIZE,
                    BOOT_COUNTER_SIZE,
                    spec.completed_boot_count,
                )?;
            },
            _ => {},
        }
    }
    Ok(())
}

/// Build an image of one or two equally sized partitions.
pub fn create_image(specs: &[PartitionSpec]) -> Result<Vec<u8>, BuildError> {
    match specs {
        [] => return Err(BuildError::NoPartitions),
        [first, second] if first.size_bytes != second.size_bytes => {
            return Err(BuildError::PartitionSizeMismatch {
                first: first.size_bytes,
                second: second.size_bytes,
            });
        },
        [_] | [_, _] => {},
        _ => return Err(BuildError::TooManyPartitions(specs.len())),
    }

    let mut image = Vec::new();
    for spec in specs {
        image.extend(build_partition(spec)?);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::partition::Partition;
    use crate::image::file::verify_file_wrapper;
    use crate::image::header::verify_header;

    #[test]
    fn test_counters_reserved_first() {
        let mut spec = PartitionSpec::new(16 * BLOCK_SIZE);
        spec.regions = vec![RegionSpec::with_data(RegionId::SpBl1, vec![0xAB; 5000])];
        let bytes = build_partition(&spec).unwrap();

        let partition = Partition::scan(0, &bytes);
        assert!(partition.valid);
        let layout: Vec<_> = partition
            .regions
            .iter()
            .map(|r| (r.region_id, r.offset_blocks, r.size_blocks))
            .collect();
        assert_eq!(
            layout,
            [
                (RegionId::PriorityDesignator, 1, 1),
                (RegionId::BootCounters, 2, 1),
                (RegionId::SpBl1, 3, 2),
            ]
        );
        assert!(bytes[5 * BLOCK_SIZE..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_region_auto_size_boundary() {
        let exact = BLOCK_SIZE - FILE_WRAPPER_SIZE;
        for (len, blocks) in [(0, 1), (exact, 1), (exact + 1, 2)] {
            let mut spec = PartitionSpec::new(8 * BLOCK_SIZE);
            spec.regions = vec![RegionSpec::with_data(RegionId::SpBl2, vec![0; len])];
            let partition = Partition::scan(0, &build_partition(&spec).unwrap());
            let region = partition.find_region(RegionId::SpBl2).unwrap();
            assert_eq!(region.size_blocks, blocks, "payload of {len} bytes");
        }
    }

    #[test]
    fn test_file_region_is_wrapped() {
        let mut spec = PartitionSpec::new(8 * BLOCK_SIZE);
        spec.regions = vec![RegionSpec::with_data(RegionId::MasterMinion, b"mm".to_vec())];
        let bytes = build_partition(&spec).unwrap();
        let region = &bytes[3 * BLOCK_SIZE..4 * BLOCK_SIZE];
        let (offset, len) = verify_file_wrapper(region, BLOCK_SIZE).unwrap();
        assert_eq!(&region[offset..offset + len], b"mm");
    }

    #[test]
    fn test_counters_seeded() {
        let mut spec = PartitionSpec::new(4 * BLOCK_SIZE);
        spec.priority = 9;
        spec.attempted_boot_count = 3;
        spec.completed_boot_count = 2;
        let partition = Partition::scan(0, &build_partition(&spec).unwrap());
        assert_eq!(partition.priority_value(), Some(9));
        assert_eq!(partition.attempted_boot_count(), Some(3));
        assert_eq!(partition.completed_boot_count(), Some(2));
        assert!(partition.boot_incomplete());
    }

    #[test]
    fn test_explicit_counter_region_keeps_data() {
        let mut spec = PartitionSpec::new(4 * BLOCK_SIZE);
        spec.priority = 1;
        spec.regions = vec![
            RegionSpec::new(RegionId::BootCounters),
            RegionSpec::with_data(RegionId::PriorityDesignator, vec![0b1111_1100]),
        ];
        let partition = Partition::scan(0, &build_partition(&spec).unwrap());
        assert_eq!(partition.regions.len(), 2);
        assert_eq!(partition.regions[0].region_id, RegionId::PriorityDesignator);
        assert_eq!(partition.priority_value(), Some(2));
    }

    #[test]
    fn test_header_fields() {
        let mut spec = PartitionSpec::new(4 * BLOCK_SIZE);
        spec.image_version = 0x0102_0003;
        let header = verify_header(&build_partition(&spec).unwrap()).unwrap();
        assert_eq!(header.partition_size_blocks, 4);
        assert_eq!(header.image_version, 0x0102_0003);
        assert_eq!(header.regions_count, 2);
    }

    #[test]
    fn test_build_errors() {
        let with = |regions: Vec<RegionSpec>| {
            let mut spec = PartitionSpec::new(4 * BLOCK_SIZE);
            spec.regions = regions;
            build_partition(&spec)
        };

        assert_eq!(
            build_partition(&PartitionSpec::new(1000)),
            Err(BuildError::PartitionSizeNotAligned(1000))
        );
        assert_eq!(
            with(vec![RegionSpec::new(RegionId::Invalid)]),
            Err(BuildError::InvalidRegionId(RegionId::Invalid))
        );
        assert_eq!(
            with(vec![RegionSpec::new(RegionId::SpBl1), RegionSpec::new(RegionId::SpBl1)]),
            Err(BuildError::DuplicateRegion(RegionId::SpBl1))
        );
        assert_eq!(
            with(vec![RegionSpec::new(RegionId::SpBl1).with_size(100)]),
            Err(BuildError::RegionSizeNotAligned {
                id: RegionId::SpBl1,
                size: 100
            })
        );
        assert_eq!(
            with(vec![RegionSpec::new(RegionId::ConfigurationData).with_size(2 * BLOCK_SIZE)]),
            Err(BuildError::ControlRegionSize {
                id: RegionId::ConfigurationData,
                size: 2 * BLOCK_SIZE
            })
        );
        assert_eq!(
            with(vec![RegionSpec::with_data(
                RegionId::ConfigurationData,
                vec![0; BLOCK_SIZE + 1]
            )]),
            Err(BuildError::ControlDataTooLarge {
                id: RegionId::ConfigurationData,
                len: BLOCK_SIZE + 1
            })
        );
        assert_eq!(
            with(vec![
                RegionSpec::with_data(RegionId::SpBl1, vec![0; 100]).with_size(BLOCK_SIZE),
                RegionSpec::new(RegionId::SpBl2).with_size(2 * BLOCK_SIZE),
            ]),
            Err(BuildError::LayoutOverflow {
                id: RegionId::SpBl2,
                end: 6,
                partition_blocks: 4
            })
        );
        assert!(matches!(
            with(vec![RegionSpec::with_data(RegionId::SpBl1, vec![0; BLOCK_SIZE]).with_size(BLOCK_SIZE)]),
            Err(BuildError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn test_create_image_partition_count() {
        let spec = PartitionSpec::new(4 * BLOCK_SIZE);
        assert_eq!(create_image(&[]), Err(BuildError::NoPartitions));
        assert_eq!(
            create_image(&[spec.clone(), spec.clone(), spec.clone()]),
            Err(BuildError::TooManyPartitions(3))
        );
        assert_eq!(
            create_image(&[spec.clone(), PartitionSpec::new(8 * BLOCK_SIZE)]),
            Err(BuildError::PartitionSizeMismatch {
                first: 4 * BLOCK_SIZE,
                second: 8 * BLOCK_SIZE
            })
        );
        assert_eq!(create_image(&[spec.clone(), spec]).unwrap().len(), 8 * BLOCK_SIZE);
    }
}
