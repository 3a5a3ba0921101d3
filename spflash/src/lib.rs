//! # spflash
//!
//! Dual-partition firmware flash images for a service processor.
//!
//! This crate provides the on-flash format and the logic built on it:
//!
//! - Thermometer counters, partition headers, region tables and file wrappers
//! - Partition scanning and active-partition selection
//! - Firmware update of the passive partition with read-back verification
//! - Boot counter bookkeeping and firmware status
//! - Host-side image creation, inspection, extraction and replacement
//!
//! ## Image layout
//!
//! The flash holds two equally sized partitions. Each starts with a header
//! block describing its regions; the boot loader boots the valid partition
//! with the higher priority counter and the updater always writes the other.
//!
//! ## Features
//!
//! - `serde`: Serialization support for report types
//!
//! ## Example
//!
//! ```rust
//! use spflash::flash::{MemoryFlash, scan_partitions, select_active};
//! use spflash::image::BLOCK_SIZE;
//! use spflash::image::region::RegionId;
//! use spflash::tool::builder::{PartitionSpec, RegionSpec, create_image};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut a = PartitionSpec::new(8 * BLOCK_SIZE);
//!     a.priority = 1;
//!     a.regions.push(RegionSpec::with_data(RegionId::SpBl1, b"bl1".to_vec()));
//!     let b = PartitionSpec::new(8 * BLOCK_SIZE);
//!
//!     let mut flash = MemoryFlash::from_bytes(create_image(&[a, b])?, BLOCK_SIZE);
//!     let [first, second] = scan_partitions(&mut flash)?;
//!     let selection = select_active(&first, &second)?;
//!     println!("booting partition {}", selection.active);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flash;
pub mod image;
pub mod tool;

// Re-exports for convenience
pub use {
    error::{Error, Result},
    flash::{
        FirmwareStatus, FlashDevice, MemoryFlash, Partition, SelectReason, Selection, Updater,
        firmware_status, select_active,
    },
    image::{
        BLOCK_SIZE,
        counter::Counter,
        header::PartitionHeader,
        region::{RegionDescriptor, RegionId},
    },
    tool::{
        ImageLayout, detect_layout, load_image,
        builder::{PartitionSpec, RegionSpec, create_image},
        extract::{RegionSelector, extract_all, extract_region, replace_region},
        view::{ImageReport, view_image},
    },
};
