//! Partition scanner.
//!
//! Scanning never trusts flash contents: every structure is verified before
//! use, and a failed check downgrades the partition to invalid instead of
//! aborting. Whatever was decoded before the failure is kept so diagnostic
//! tools can still report it.

use log::{debug, warn};
use thiserror::Error;

use super::device::{FlashDevice, FlashError};
use crate::image::BLOCK_SIZE;
use crate::image::counter::{Counter, split_boot_counters};
use crate::image::header::{HEADER_SIZE, HeaderError, PartitionHeader, verify_header};
use crate::image::region::{REGION_INFO_SIZE, RegionDescriptor, RegionError, RegionId, verify_region};

/// Reason a partition was marked invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScanError {
    /// Header failed verification.
    #[error("header: {0}")]
    Header(#[from] HeaderError),

    /// A region table entry failed verification.
    #[error("region {index}: {source}")]
    Region {
        /// Position in the region table.
        index: usize,
        /// Underlying error.
        source: RegionError,
    },
}

/// A scanned partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition index on the device (0 or 1).
    pub index: usize,
    /// Verified header, if it passed.
    pub header: Option<PartitionHeader>,
    /// Region descriptors verified so far, in table order.
    pub regions: Vec<RegionDescriptor>,
    /// Priority counter, if the region is present.
    pub priority: Option<Counter>,
    /// Attempted-boot counter, if the region is present.
    pub attempted_boots: Option<Counter>,
    /// Completed-boot counter, if the region is present.
    pub completed_boots: Option<Counter>,
    /// Whether the header and every region passed verification.
    pub valid: bool,
    /// First verification failure.
    pub error: Option<ScanError>,
}

impl Partition {
    /// Scan the raw bytes of one partition.
    pub fn scan(index: usize, bytes: &[u8]) -> Self {
        let mut partition = Self {
            index,
            header: None,
            regions: Vec::new(),
            priority: None,
            attempted_boots: None,
            completed_boots: None,
            valid: false,
            error: None,
        };

        let header = match verify_header(bytes) {
            Ok(header) => header,
            Err(e) => {
                if e.is_absent() {
                    debug!("Partition {index}: erased");
                } else {
                    warn!("Partition {index}: {e}");
                }
                partition.error = Some(e.into());
                return partition;
            },
        };
        partition.header = Some(header);

        let actual_blocks = bytes.len() / BLOCK_SIZE;
        if bytes.len() % BLOCK_SIZE != 0 || header.partition_size_blocks as usize != actual_blocks {
            let e = HeaderError::SizeMismatch {
                declared: header.partition_size_blocks,
                actual: actual_blocks,
            };
            warn!("Partition {index}: {e}");
            partition.error = Some(e.into());
            return partition;
        }

        let mut next_offset = 1u32;
        for i in 0..header.regions_count as usize {
            let start = HEADER_SIZE + i * REGION_INFO_SIZE;
            let entry = bytes.get(start..).unwrap_or(&[]);
            match verify_region(entry, header.partition_size_blocks, next_offset) {
                Ok(desc) => {
                    if let RegionId::Unknown(v) = desc.region_id {
                        debug!("Partition {index}: skipping unknown region id {v:#x}");
                    }
                    next_offset += desc.size_blocks;
                    partition.regions.push(desc);
                },
                Err(source) => {
                    warn!("Partition {index}: region {i}: {source}");
                    partition.error = Some(ScanError::Region { index: i, source });
                    break;
                },
            }
        }

        partition.load_counters(bytes);
        partition.valid = partition.error.is_none();
        debug!(
            "Partition {index}: {} regions, valid={}, priority={:?}",
            partition.regions.len(),
            partition.valid,
            partition.priority_value()
        );
        partition
    }

    fn load_counters(&mut self, bytes: &[u8]) {
        for desc in &self.regions {
            let Some(block) = bytes.get(desc.byte_range()) else {
                continue;
            };
            match desc.region_id {
                RegionId::PriorityDesignator => self.priority = Some(Counter::decode(block)),
                RegionId::BootCounters => {
                    let (attempted, completed) = split_boot_counters(block);
                    self.attempted_boots = Some(attempted);
                    self.completed_boots = Some(completed);
                },
                _ => {},
            }
        }
    }

    /// Priority counter value; `None` when the partition has no priority
    /// region, which ranks below every present value.
    pub fn priority_value(&self) -> Option<u32> {
        self.priority.as_ref().map(Counter::value)
    }

    /// Attempted-boot counter value.
    pub fn attempted_boot_count(&self) -> Option<u32> {
        self.attempted_boots.as_ref().map(Counter::value)
    }

    /// Completed-boot counter value.
    pub fn completed_boot_count(&self) -> Option<u32> {
        self.completed_boots.as_ref().map(Counter::value)
    }

    /// Whether the last boot from this partition never completed.
    pub fn boot_incomplete(&self) -> bool {
        matches!(
            (self.attempted_boot_count(), self.completed_boot_count()),
            (Some(attempted), Some(completed)) if attempted != completed
        )
    }

    /// Whether any counter field is corrupted.
    pub fn counters_corrupted(&self) -> bool {
        [&self.priority, &self.attempted_boots, &self.completed_boots]
            .into_iter()
            .flatten()
            .any(Counter::is_corrupted)
    }

    /// Find a region by identifier.
    pub fn find_region(&self, id: RegionId) -> Option<&RegionDescriptor> {
        self.regions.iter().find(|r| r.region_id == id)
    }
}

/// Size of one partition on `flash`.
pub fn partition_size<F: FlashDevice + ?Sized>(flash: &F) -> usize {
    flash.size() / 2
}

/// Read and scan partition `index` (0 or 1) of `flash`.
pub fn scan_partition<F: FlashDevice + ?Sized>(
    flash: &mut F,
    index: usize,
) -> Result<Partition, FlashError> {
    let size = partition_size(flash);
    let bytes = flash.read_vec(index * size, size)?;
    Ok(Partition::scan(index, &bytes))
}

/// Scan both partitions of `flash`.
pub fn scan_partitions<F: FlashDevice + ?Sized>(flash: &mut F) -> Result<[Partition; 2], FlashError> {
    Ok([scan_partition(flash, 0)?, scan_partition(flash, 1)?])
}
