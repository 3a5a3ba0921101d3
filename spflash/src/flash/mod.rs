//! Dual-partition flash handling.
//!
//! The flash is split into two equal halves, partition 0 at offset 0 and
//! partition 1 at `size / 2`. The boot path scans both, selects the one to
//! boot and maintains its boot counters; the update path rewrites the other
//! one and then hands it the higher priority.

pub mod device;
pub mod partition;
pub mod selector;
pub mod status;
pub mod update;

pub use device::{FlashDevice, FlashError, MemoryFlash};
pub use partition::{Partition, ScanError, scan_partition, scan_partitions};
pub use selector::{SelectError, SelectReason, Selection, select_active};
pub use status::{
    BootCounterError, FirmwareStatus, PartitionStatus, firmware_status, record_boot_attempt,
    record_boot_completed,
};
pub use update::{CompanionUpdater, SamplingControl, UpdateError, UpdateReport, Updater};
