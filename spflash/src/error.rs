//! Error types for spflash.

use std::io;
use thiserror::Error;

use crate::flash::{BootCounterError, FlashError, ScanError, SelectError, UpdateError};
use crate::image::counter::CounterError;
use crate::image::file::FileError;
use crate::image::header::HeaderError;
use crate::image::region::RegionError;
use crate::tool::LayoutError;
use crate::tool::builder::BuildError;
use crate::tool::extract::ExtractError;

/// Result type for spflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for spflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (image and dump files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Counter field error.
    #[error("Counter error: {0}")]
    Counter(#[from] CounterError),

    /// Partition header error.
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    /// Region descriptor error.
    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    /// File wrapper error.
    #[error("File error: {0}")]
    File(#[from] FileError),

    /// Flash device error.
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// Partition scan error.
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Partition selection error.
    #[error("Selection error: {0}")]
    Select(#[from] SelectError),

    /// Firmware update error.
    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    /// Boot counter bookkeeping error.
    #[error("Boot counter error: {0}")]
    BootCounter(#[from] BootCounterError),

    /// Image layout error.
    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),

    /// Image creation error.
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Extraction or replacement error.
    #[error("Extract error: {0}")]
    Extract(#[from] ExtractError),
}
