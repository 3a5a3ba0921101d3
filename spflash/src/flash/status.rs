//! Firmware status and boot bookkeeping.

use log::{debug, info};
use thiserror::Error;

use super::device::{FlashDevice, FlashError};
use super::partition::{Partition, partition_size, scan_partition, scan_partitions};
use super::selector::{SelectReason, select_active};
use crate::image::counter::{BOOT_COUNTER_SIZE, Counter, CounterError};
use crate::image::region::RegionId;

/// State of one partition as seen by the boot loader.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PartitionStatus {
    /// Partition index (0 or 1).
    pub index: usize,
    /// Whether the partition passed verification.
    pub valid: bool,
    /// First verification failure, if any.
    pub error: Option<String>,
    /// Image version from the header.
    pub image_version: Option<u32>,
    /// Priority counter value.
    pub priority: Option<u32>,
    /// Attempted-boot counter value.
    pub attempted_boots: Option<u32>,
    /// Completed-boot counter value.
    pub completed_boots: Option<u32>,
    /// Attempted and completed counts differ.
    pub boot_incomplete: bool,
    /// At least one counter field is corrupted.
    pub counters_corrupted: bool,
}

impl From<&Partition> for PartitionStatus {
    fn from(p: &Partition) -> Self {
        Self {
            index: p.index,
            valid: p.valid,
            error: p.error.map(|e| e.to_string()),
            image_version: p.header.map(|h| h.image_version),
            priority: p.priority_value(),
            attempted_boots: p.attempted_boot_count(),
            completed_boots: p.completed_boot_count(),
            boot_incomplete: p.boot_incomplete(),
            counters_corrupted: p.counters_corrupted(),
        }
    }
}

/// Both partitions plus the selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareStatus {
    /// Per-partition state, index order.
    pub partitions: Vec<PartitionStatus>,
    /// Partition that would boot, if any.
    pub active: Option<usize>,
    /// Why it was picked.
    pub reason: Option<SelectReason>,
}

/// Scan `flash` and report what the boot loader would see.
pub fn firmware_status<F: FlashDevice + ?Sized>(flash: &mut F) -> Result<FirmwareStatus, FlashError> {
    let [a, b] = scan_partitions(flash)?;
    let selection = select_active(&a, &b).ok();
    Ok(FirmwareStatus {
        partitions: vec![PartitionStatus::from(&a), PartitionStatus::from(&b)],
        active: selection.map(|s| s.active),
        reason: selection.map(|s| s.reason),
    })
}

/// Boot counter bookkeeping errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootCounterError {
    /// Partition index is not 0 or 1.
    #[error("partition index {0} out of range")]
    PartitionIndex(usize),

    /// Partition failed verification.
    #[error("partition {0} is not valid")]
    InvalidPartition(usize),

    /// Partition has no boot counters region.
    #[error("partition {0} has no boot counters region")]
    MissingRegion(usize),

    /// Counter cannot advance further.
    #[error(transparent)]
    Counter(#[from] CounterError),

    /// Flash access failed.
    #[error(transparent)]
    Flash(#[from] FlashError),

    /// Counter did not read back with the expected value.
    #[error("boot counter reads {actual} after write, expected {expected}")]
    Mismatch {
        /// Value written.
        expected: u32,
        /// Value read back.
        actual: u32,
    },
}

#[derive(Debug, Clone, Copy)]
enum BootEvent {
    Attempted,
    Completed,
}

/// Record that a boot from partition `index` has started.
///
/// Returns the new attempted-boot count.
pub fn record_boot_attempt<F: FlashDevice + ?Sized>(
    flash: &mut F,
    index: usize,
) -> Result<u32, BootCounterError> {
    record_boot(flash, index, BootEvent::Attempted)
}

/// Record that a boot from partition `index` has completed.
///
/// Returns the new completed-boot count.
pub fn record_boot_completed<F: FlashDevice + ?Sized>(
    flash: &mut F,
    index: usize,
) -> Result<u32, BootCounterError> {
    record_boot(flash, index, BootEvent::Completed)
}

fn record_boot<F: FlashDevice + ?Sized>(
    flash: &mut F,
    index: usize,
    event: BootEvent,
) -> Result<u32, BootCounterError> {
    if index > 1 {
        return Err(BootCounterError::PartitionIndex(index));
    }
    let partition = scan_partition(flash, index)?;
    if !partition.valid {
        return Err(BootCounterError::InvalidPartition(index));
    }
    let region = partition
        .find_region(RegionId::BootCounters)
        .ok_or(BootCounterError::MissingRegion(index))?;

    let half = match event {
        BootEvent::Attempted => 0,
        BootEvent::Completed => BOOT_COUNTER_SIZE,
    };
    let offset = index * partition_size(flash) + region.offset_bytes() + half;

    // Program only; the other half shares the erase block.
    let mut counter = Counter::decode(&flash.read_vec(offset, BOOT_COUNTER_SIZE)?);
    counter.increment()?;
    let expected = counter.value();
    flash.program(offset, counter.as_bytes())?;

    let actual = Counter::decode(&flash.read_vec(offset, BOOT_COUNTER_SIZE)?).value();
    if actual != expected {
        return Err(BootCounterError::Mismatch { expected, actual });
    }
    debug!("Partition {index}: {event:?} boot counter at {offset:#x}");
    info!("Partition {index}: {event:?} boots = {actual}");
    Ok(actual)
}
