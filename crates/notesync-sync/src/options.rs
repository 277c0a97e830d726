//! Runtime options of one synchronization run

use notesync_config::Config;
use notesync_types::{ConcurrencyLimit, RequestContext, RetryConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options controlling one call to
/// [`Synchronizer::synchronize_account`](crate::Synchronizer::synchronize_account)
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Download note thumbnails together with full notes
    pub download_note_thumbnails: bool,
    /// Directory receiving rendered ink note images
    pub ink_note_images_storage_dir: Option<PathBuf>,
    /// Maximum number of full note downloads in flight
    pub max_concurrent_note_downloads: ConcurrencyLimit,
    /// Maximum number of full resource downloads in flight
    pub max_concurrent_resource_downloads: ConcurrencyLimit,
    /// Maximum number of entries requested per sync chunk
    pub max_sync_chunk_entries: u32,
    /// How often download and send may be repeated within one run
    pub max_sync_repeats: u32,
    /// Timeout handed to every remote request
    pub request_timeout: Duration,
    /// Retry policy handed to every remote request
    pub retry: RetryConfig,
    /// Root of the per-account persistence directories
    pub persistence_root: PathBuf,
    /// Remove cached sync chunks once their scope was processed
    pub clear_sync_chunks_after_processing: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SyncOptions {
    /// Derive options from a loaded configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            download_note_thumbnails: config.sync.download_note_thumbnails,
            ink_note_images_storage_dir: config.sync.ink_note_images_storage_dir.clone(),
            max_concurrent_note_downloads: config.sync.max_concurrent_note_downloads,
            max_concurrent_resource_downloads: config.sync.max_concurrent_resource_downloads,
            max_sync_chunk_entries: config.sync.max_sync_chunk_entries,
            max_sync_repeats: config.sync.max_sync_repeats,
            request_timeout: config.network.timeouts.request_timeout,
            retry: config.network.retry.clone(),
            persistence_root: config.persistence.root_dir.clone(),
            clear_sync_chunks_after_processing: config
                .persistence
                .clear_sync_chunks_after_processing,
        }
    }

    /// Set the persistence root
    pub fn with_persistence_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.persistence_root = root.as_ref().to_path_buf();
        self
    }

    /// Set both download concurrency limits
    pub fn with_download_concurrency(mut self, limit: ConcurrencyLimit) -> Self {
        self.max_concurrent_note_downloads = limit;
        self.max_concurrent_resource_downloads = limit;
        self
    }

    /// Enable or disable thumbnail downloads
    pub fn with_note_thumbnails(mut self, enabled: bool) -> Self {
        self.download_note_thumbnails = enabled;
        self
    }

    /// Store rendered ink note images in the given directory
    pub fn with_ink_note_images_storage_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.ink_note_images_storage_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Keep or drop cached sync chunks after processing
    pub fn with_sync_chunks_retained(mut self, retained: bool) -> Self {
        self.clear_sync_chunks_after_processing = !retained;
        self
    }

    /// Request context carrying the given token
    pub fn request_context(&self, auth_token: &str) -> RequestContext {
        RequestContext {
            auth_token: auth_token.to_string(),
            request_timeout: self.request_timeout,
            retry: self.retry.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.sync.download_note_thumbnails = true;
        config.sync.max_sync_chunk_entries = 10;
        config.persistence.root_dir = PathBuf::from("/var/lib/notesync");

        let options = SyncOptions::from_config(&config);
        assert!(options.download_note_thumbnails);
        assert_eq!(options.max_sync_chunk_entries, 10);
        assert_eq!(options.persistence_root, PathBuf::from("/var/lib/notesync"));
        assert_eq!(options.max_concurrent_note_downloads.get(), 100);
    }

    #[test]
    fn test_request_context_carries_token() {
        let options = SyncOptions::default();
        let ctx = options.request_context("token");
        assert_eq!(ctx.auth_token, "token");
        assert_eq!(ctx.request_timeout, options.request_timeout);
    }
}
