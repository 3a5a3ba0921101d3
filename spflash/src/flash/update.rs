//! Firmware update of the passive partition.
//!
//! The sequence is strictly linear and never goes back once a step succeeds:
//!
//! 1. verify the staged image
//! 2. erase and program the passive partition page by page
//! 3. read every page back and compare
//! 4. write the configuration region
//! 5. rescan the passive partition from flash
//! 6. run the companion (PMIC) update with sampling paused
//! 7. raise the passive partition's priority above the active one
//!
//! Until step 7 the active partition keeps winning selection, so any failure
//! leaves the device booting the image it booted before. An active partition
//! without a priority counter loses to any partition that has one, so in that
//! case the passive header block stays erased until step 7.

use log::{debug, error, info, warn};
use thiserror::Error;

use super::device::{FlashDevice, FlashError};
use super::partition::{Partition, ScanError, partition_size, scan_partition, scan_partitions};
use super::selector::select_active;
use crate::image::BLOCK_SIZE;
use crate::image::counter::{Counter, CounterError};
use crate::image::header::HeaderError;
use crate::image::region::{RegionError, RegionId};

/// Companion controller firmware update entry point.
pub trait CompanionUpdater {
    /// Run the update; the error string is reported verbatim.
    fn update(&mut self) -> Result<(), String>;
}

/// Background sampling that must be quiet while the companion updates.
pub trait SamplingControl {
    /// Stop sampling.
    fn pause(&mut self);

    /// Restart sampling.
    fn resume(&mut self);
}

/// Keeps sampling paused for as long as it lives.
struct SamplingPause<'a, S: SamplingControl + ?Sized> {
    control: &'a mut S,
}

impl<'a, S: SamplingControl + ?Sized> SamplingPause<'a, S> {
    fn new(control: &'a mut S) -> Self {
        debug!("Pausing sampling");
        control.pause();
        Self { control }
    }
}

impl<S: SamplingControl + ?Sized> Drop for SamplingPause<'_, S> {
    fn drop(&mut self) {
        debug!("Resuming sampling");
        self.control.resume();
    }
}

/// Update sequence errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// Partition size is not a multiple of the block and page sizes.
    #[error("unsupported flash geometry: partition {partition_size} bytes, page {page_size} bytes")]
    Geometry {
        /// Partition size in bytes.
        partition_size: usize,
        /// Flash page size in bytes.
        page_size: usize,
    },

    /// Neither partition on flash is valid.
    #[error("no active partition to update from")]
    NoActivePartition,

    /// Staged image length differs from the partition size.
    #[error("image is {actual} bytes, partition is {expected} bytes")]
    ImageSize {
        /// Partition size in bytes.
        expected: usize,
        /// Image size in bytes.
        actual: usize,
    },

    /// Staged image header failed verification.
    #[error("image header invalid: {0}")]
    HeaderInvalid(HeaderError),

    /// Staged image region table failed verification.
    #[error("image region {index} invalid: {source}")]
    RegionInvalid {
        /// Position in the region table.
        index: usize,
        /// Underlying error.
        source: RegionError,
    },

    /// Staged image has no priority designator region.
    #[error("image has no priority designator region")]
    MissingPriorityRegion,

    /// Flash read failed while inspecting partitions.
    #[error(transparent)]
    Flash(#[from] FlashError),

    /// Erase or program of a page failed.
    #[error("programming page {page} failed: {source}")]
    Program {
        /// Page index within the partition.
        page: usize,
        /// Underlying error.
        source: FlashError,
    },

    /// Reading a page back failed.
    #[error("reading back page {page} failed: {source}")]
    Readback {
        /// Page index within the partition.
        page: usize,
        /// Underlying error.
        source: FlashError,
    },

    /// A programmed page does not match the staged image.
    #[error("read-back mismatch on page {page}")]
    ReadbackMismatch {
        /// Page index within the partition.
        page: usize,
    },

    /// Configuration data does not fit in one block.
    #[error("configuration data is {len} bytes, region holds 4096")]
    ConfigTooLarge {
        /// Data length in bytes.
        len: usize,
    },

    /// Writing the configuration region failed.
    #[error("writing configuration region failed: {0}")]
    ConfigWrite(FlashError),

    /// Configuration region did not read back as written.
    #[error("configuration region read-back mismatch")]
    ConfigMismatch,

    /// The freshly programmed partition failed its rescan.
    #[error("rescan of updated partition failed: {0}")]
    RescanInvalid(ScanError),

    /// The companion controller update failed.
    #[error("companion update failed: {0}")]
    Companion(String),

    /// The priority counter cannot reach the requested value.
    #[error("priority counter cannot reach {requested}: {source}")]
    PriorityExhausted {
        /// Value the swap needed.
        requested: u32,
        /// Underlying error.
        source: CounterError,
    },

    /// Programming a counter region failed.
    #[error("writing counter failed: {0}")]
    CounterWrite(FlashError),

    /// A counter did not read back with the expected value.
    #[error("counter reads {actual} after write, expected {expected}")]
    CounterMismatch {
        /// Value written.
        expected: u32,
        /// Value read back.
        actual: u32,
    },
}

/// Outcome of a successful update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    /// Partition that was active before the update.
    pub previous_active: usize,
    /// Partition that was reprogrammed and is now active.
    pub updated: usize,
    /// Priority counter value of the updated partition.
    pub new_priority: u32,
    /// Number of flash pages programmed.
    pub pages: usize,
}

/// Drives the update sequence against a flash device.
pub struct Updater<'a, F: FlashDevice + ?Sized> {
    flash: &'a mut F,
    config_data: Option<Vec<u8>>,
    companion: Option<&'a mut dyn CompanionUpdater>,
    sampling: Option<&'a mut dyn SamplingControl>,
}

impl<'a, F: FlashDevice + ?Sized> Updater<'a, F> {
    /// Create an updater for `flash`.
    pub fn new(flash: &'a mut F) -> Self {
        Self {
            flash,
            config_data: None,
            companion: None,
            sampling: None,
        }
    }

    /// Write `data` to the configuration region instead of carrying over the
    /// active partition's configuration.
    #[must_use]
    pub fn with_config_data(mut self, data: Vec<u8>) -> Self {
        self.config_data = Some(data);
        self
    }

    /// Run `companion` before the priority swap.
    #[must_use]
    pub fn with_companion(mut self, companion: &'a mut dyn CompanionUpdater) -> Self {
        self.companion = Some(companion);
        self
    }

    /// Pause `sampling` while the companion update runs.
    #[must_use]
    pub fn with_sampling(mut self, sampling: &'a mut dyn SamplingControl) -> Self {
        self.sampling = Some(sampling);
        self
    }

    /// Write `image` to the passive partition and make it active.
    ///
    /// `progress` receives (step, done, total) for the page loops.
    pub fn run(
        &mut self,
        image: &[u8],
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<UpdateReport, UpdateError> {
        let size = partition_size(&*self.flash);
        let page_size = self.flash.page_size();
        if size == 0
            || page_size == 0
            || size % BLOCK_SIZE != 0
            || size % page_size != 0
            || BLOCK_SIZE % page_size != 0
        {
            return Err(UpdateError::Geometry {
                partition_size: size,
                page_size,
            });
        }

        let [first, second] = scan_partitions(&mut *self.flash)?;
        let selection =
            select_active(&first, &second).map_err(|_| UpdateError::NoActivePartition)?;
        let (active, passive) = if selection.active == first.index {
            (first, second)
        } else {
            (second, first)
        };
        info!(
            "Updating partition {} (active: {}, priority {:?})",
            passive.index,
            active.index,
            active.priority_value()
        );

        info!("Step 1/7: verifying staged image");
        let staged = verify_staged(image, size, passive.index)?;
        let mut active_priority = active.priority_value().unwrap_or(0);
        let carried = passive.priority.as_ref().filter(|counter| {
            !counter.is_corrupted()
                && counter.as_bytes().len() == BLOCK_SIZE
                && (counter.value() < active_priority
                    || (counter.value() == active_priority && passive.index != 0))
        });
        let scratch = reset_counters(image, &staged, carried);
        progress("verify", 1, 1);

        if passive.index == 0 && active.priority_value() == Some(0) {
            // Partition 0 wins ties, so lift the active one off zero first.
            debug!("Raising active partition priority to 1 before programming");
            self.write_priority(&active, 1)?;
            active_priority = 1;
        }

        let base = passive.index * size;
        let pages = size / page_size;
        let deferred = if active.priority_value().is_none() {
            info!("Active partition has no priority counter, header block goes last");
            BLOCK_SIZE / page_size
        } else {
            0
        };
        let erased = vec![0xFFu8; page_size];

        info!("Step 2/7: programming {pages} pages at {base:#x}");
        for page in 0..pages {
            let offset = base + page * page_size;
            let chunk = &scratch[page * page_size..(page + 1) * page_size];
            self.flash
                .erase(offset, page_size)
                .and_then(|()| {
                    if page < deferred {
                        Ok(())
                    } else {
                        self.flash.program(offset, chunk)
                    }
                })
                .map_err(|source| {
                    error!("Programming page {page} failed: {source}");
                    UpdateError::Program { page, source }
                })?;
            progress("program", page + 1, pages);
        }

        info!("Step 3/7: read-back verify");
        let mut buf = vec![0u8; page_size];
        for page in 0..pages {
            let offset = base + page * page_size;
            self.flash
                .read(offset, &mut buf)
                .map_err(|source| UpdateError::Readback { page, source })?;
            let expected = if page < deferred {
                &erased[..]
            } else {
                &scratch[page * page_size..(page + 1) * page_size]
            };
            if buf[..] != *expected {
                error!("Read-back mismatch on page {page}");
                return Err(UpdateError::ReadbackMismatch { page });
            }
            progress("readback", page + 1, pages);
        }

        info!("Step 4/7: writing configuration region");
        self.write_config(&active, &staged, base)?;

        info!("Step 5/7: rescanning partition {}", passive.index);
        let rescanned = if deferred == 0 {
            scan_partition(&mut *self.flash, passive.index)?
        } else {
            let mut bytes = self.flash.read_vec(base, size)?;
            let header_len = deferred * page_size;
            bytes[..header_len].copy_from_slice(&scratch[..header_len]);
            Partition::scan(passive.index, &bytes)
        };
        if let Some(e) = rescanned.error {
            error!("Updated partition failed rescan: {e}");
            return Err(UpdateError::RescanInvalid(e));
        }

        info!("Step 6/7: companion update");
        self.run_companion()?;

        info!("Step 7/7: swapping priority");
        let new_priority = active_priority.checked_add(1).ok_or(UpdateError::PriorityExhausted {
            requested: u32::MAX,
            source: CounterError::ValueTooLarge {
                value: u32::MAX,
                capacity: active_priority,
            },
        })?;
        if deferred > 0 {
            self.write_header_block(base, &scratch[..deferred * page_size])?;
        }
        self.write_priority(&rescanned, new_priority)?;

        info!(
            "Partition {} is now active with priority {new_priority}",
            passive.index
        );
        Ok(UpdateReport {
            previous_active: active.index,
            updated: passive.index,
            new_priority,
            pages,
        })
    }

    /// Program the header pages left erased by step 2 and read them back.
    fn write_header_block(&mut self, base: usize, header: &[u8]) -> Result<(), UpdateError> {
        let page_size = self.flash.page_size();
        debug!("Programming {} header bytes at {base:#x}", header.len());
        for (page, chunk) in header.chunks(page_size).enumerate() {
            self.flash
                .program(base + page * page_size, chunk)
                .map_err(|source| UpdateError::Program { page, source })?;
        }

        let written = self.flash.read_vec(base, header.len())?;
        let mismatch = written
            .chunks(page_size)
            .zip(header.chunks(page_size))
            .position(|(got, want)| got != want);
        if let Some(page) = mismatch {
            error!("Header read-back mismatch on page {page}");
            return Err(UpdateError::ReadbackMismatch { page });
        }
        Ok(())
    }

    /// Advance the priority counter of `partition` to `value` in place.
    fn write_priority(&mut self, partition: &Partition, value: u32) -> Result<(), UpdateError> {
        let desc = partition
            .find_region(RegionId::PriorityDesignator)
            .ok_or(UpdateError::MissingPriorityRegion)?;
        let offset = partition.index * partition_size(&*self.flash) + desc.offset_bytes();
        write_counter(&mut *self.flash, offset, BLOCK_SIZE, value)
    }

    fn write_config(
        &mut self,
        active: &Partition,
        staged: &Partition,
        base: usize,
    ) -> Result<(), UpdateError> {
        let Some(target) = staged.find_region(RegionId::ConfigurationData) else {
            warn!("Image has no configuration region, skipping");
            return Ok(());
        };

        let data = if let Some(data) = &self.config_data {
            data.clone()
        } else if let Some(source) = active.find_region(RegionId::ConfigurationData) {
            let offset = active.index * partition_size(&*self.flash) + source.offset_bytes();
            self.flash.read_vec(offset, BLOCK_SIZE)?
        } else {
            warn!("No configuration data supplied and none to carry over");
            return Ok(());
        };
        if data.len() > BLOCK_SIZE {
            return Err(UpdateError::ConfigTooLarge { len: data.len() });
        }

        let offset = base + target.offset_bytes();
        self.flash
            .erase(offset, BLOCK_SIZE)
            .and_then(|()| self.flash.program(offset, &data))
            .map_err(UpdateError::ConfigWrite)?;

        let written = self.flash.read_vec(offset, data.len())?;
        if written != data {
            error!("Configuration region read-back mismatch");
            return Err(UpdateError::ConfigMismatch);
        }
        Ok(())
    }

    fn run_companion(&mut self) -> Result<(), UpdateError> {
        let Some(companion) = self.companion.as_deref_mut() else {
            debug!("No companion updater configured");
            return Ok(());
        };

        let result = {
            let _pause = self.sampling.as_deref_mut().map(SamplingPause::new);
            companion.update()
        };

        result.map_err(|msg| {
            error!("Companion update failed, keeping current partition: {msg}");
            UpdateError::Companion(msg)
        })
    }
}

/// Check that `image` is a complete, valid partition.
fn verify_staged(image: &[u8], size: usize, index: usize) -> Result<Partition, UpdateError> {
    if image.len() != size {
        return Err(UpdateError::ImageSize {
            expected: size,
            actual: image.len(),
        });
    }

    let staged = Partition::scan(index, image);
    match staged.error {
        Some(ScanError::Header(e)) => return Err(UpdateError::HeaderInvalid(e)),
        Some(ScanError::Region { index, source }) => {
            return Err(UpdateError::RegionInvalid { index, source });
        },
        None => {},
    }
    if staged.find_region(RegionId::PriorityDesignator).is_none() {
        return Err(UpdateError::MissingPriorityRegion);
    }
    Ok(staged)
}

/// Copy of `image` with its boot counters erased and its priority counter
/// replaced by `carried` (the passive partition's current counter, when it
/// cannot outrank the active one) or erased.
fn reset_counters(image: &[u8], staged: &Partition, carried: Option<&Counter>) -> Vec<u8> {
    let mut scratch = image.to_vec();
    for desc in &staged.regions {
        let Some(block) = scratch.get_mut(desc.byte_range()) else {
            continue;
        };
        match (desc.region_id, carried) {
            (RegionId::PriorityDesignator, Some(counter)) if counter.as_bytes().len() == block.len() => {
                block.copy_from_slice(counter.as_bytes());
            },
            (RegionId::PriorityDesignator | RegionId::BootCounters, _) => block.fill(0xFF),
            _ => {},
        }
    }
    scratch
}

/// Advance the priority counter stored in `len` bytes at `offset` to `value`
/// by programming only, then confirm the stored value.
fn write_counter<F: FlashDevice + ?Sized>(
    flash: &mut F,
    offset: usize,
    len: usize,
    value: u32,
) -> Result<(), UpdateError> {
    let mut counter = Counter::decode(&flash.read_vec(offset, len)?);
    counter
        .try_increment_to(value)
        .map_err(|source| UpdateError::PriorityExhausted {
            requested: value,
            source,
        })?;
    flash
        .program(offset, counter.as_bytes())
        .map_err(UpdateError::CounterWrite)?;

    let actual = Counter::decode(&flash.read_vec(offset, len)?).value();
    if actual != value {
        return Err(UpdateError::CounterMismatch {
            expected: value,
            actual,
        });
    }
    Ok(())
}
