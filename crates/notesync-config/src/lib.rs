//! Configuration management system for notesync
//!
//! This crate provides layered configuration for the synchronization engine,
//! supporting multiple configuration formats (YAML, TOML, JSON), validation
//! and environment variable overrides, plus the logging setup driven by it.
//!
//! # Features
//!
//! - **Multiple formats**: Support for YAML, TOML and JSON configuration files
//! - **Validation**: Type-safe configuration with validation on build
//! - **Environment overrides**: `NOTESYNC__SECTION__KEY` variables override file values
//! - **Defaults**: Sensible default values for all configuration options
//!
//! # Examples
//!
//! ```rust,no_run
//! use notesync_config::{Config, ConfigBuilder};
//!
//! let config = ConfigBuilder::new()
//!     .add_source_file("notesync.yaml")
//!     .add_env_prefix("NOTESYNC")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!(
//!     "Concurrent note downloads: {}",
//!     config.sync.max_concurrent_note_downloads.get()
//! );
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use notesync_types::{ConcurrencyLimit, RetryConfig, TimeoutConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod builder;
pub mod error;
pub mod loader;
pub mod logging;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use logging::init_logging;

/// Main configuration structure for notesync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Synchronization behaviour
    pub sync: SyncSettings,
    /// Remote request settings
    pub network: NetworkConfig,
    /// On-disk synchronization state
    pub persistence: PersistenceConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Synchronization behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Download note thumbnails together with full notes
    pub download_note_thumbnails: bool,
    /// Directory receiving rendered ink note images
    #[serde(default)]
    pub ink_note_images_storage_dir: Option<PathBuf>,
    /// Maximum number of full note downloads in flight
    pub max_concurrent_note_downloads: ConcurrencyLimit,
    /// Maximum number of full resource downloads in flight
    pub max_concurrent_resource_downloads: ConcurrencyLimit,
    /// Maximum number of entries requested per sync chunk
    pub max_sync_chunk_entries: u32,
    /// How often download and send may be repeated within one run
    pub max_sync_repeats: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            download_note_thumbnails: false,
            ink_note_images_storage_dir: None,
            max_concurrent_note_downloads: ConcurrencyLimit::default(),
            max_concurrent_resource_downloads: ConcurrencyLimit::default(),
            max_sync_chunk_entries: 50,
            max_sync_repeats: 3,
        }
    }
}

/// Remote request settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Request timeouts
    pub timeouts: TimeoutConfig,
    /// Retry policy handed to the remote client
    pub retry: RetryConfig,
}

/// On-disk synchronization state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Root of the per-account persistence directories
    pub root_dir: PathBuf,
    /// Remove cached sync chunks once their scope was processed
    pub clear_sync_chunks_after_processing: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("notesync-data"),
            clear_sync_chunks_after_processing: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Enable JSON formatting
    pub json_format: bool,
    /// Enable colored output
    pub colored_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            colored_output: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sync_settings() {
        let config = Config::default();
        assert!(!config.sync.download_note_thumbnails);
        assert!(config.sync.ink_note_images_storage_dir.is_none());
        assert_eq!(config.sync.max_concurrent_note_downloads.get(), 100);
        assert_eq!(config.sync.max_concurrent_resource_downloads.get(), 100);
        assert_eq!(config.sync.max_sync_chunk_entries, 50);
        assert!(config.persistence.clear_sync_chunks_after_processing);
    }
}
