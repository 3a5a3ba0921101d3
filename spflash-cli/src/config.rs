//! Configuration file support for spflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Explicit config file (`--config` or `SPFLASH_CONFIG`), which replaces 3 and 4
//! 3. Local config file (./spflash.toml)
//! 4. Global config file (~/.config/spflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default flash page size for offline updates.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Image creation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConfig {
    /// Image version written to headers when the template has none.
    pub image_version: Option<u32>,
    /// Print the image summary after creating it.
    pub view_after_create: Option<bool>,
}

/// Image view settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Show descriptor and file checksums.
    pub show_crc: Option<bool>,
}

/// Offline update settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Erase/program page size of the emulated flash.
    pub page_size: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Create settings.
    #[serde(default)]
    pub create: CreateConfig,
    /// View settings.
    #[serde(default)]
    pub view: ViewConfig,
    /// Update settings.
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("spflash.toml")) {
            debug!("Loaded local config from spflash.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "spflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.create.image_version.is_some() {
            self.create.image_version = other.create.image_version;
        }
        if other.create.view_after_create.is_some() {
            self.create.view_after_create = other.create.view_after_create;
        }
        if other.view.show_crc.is_some() {
            self.view.show_crc = other.view.show_crc;
        }
        if other.update.page_size.is_some() {
            self.update.page_size = other.update.page_size;
        }
    }

    /// Image version for new partitions.
    pub fn image_version(&self) -> u32 {
        self.create.image_version.unwrap_or(0)
    }

    /// Whether `create` prints a summary.
    pub fn view_after_create(&self) -> bool {
        self.create.view_after_create.unwrap_or(true)
    }

    /// Whether `view` prints checksums.
    pub fn show_crc(&self) -> bool {
        self.view.show_crc.unwrap_or(false)
    }

    /// Page size for offline updates.
    pub fn page_size(&self) -> usize {
        self.update.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }
}
