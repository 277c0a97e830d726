//! Per-scope watermarks of the last successful synchronization

use async_trait::async_trait;
use notesync_types::{Error, Guid, Result, SyncScope, Timestamp, Usn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Highest applied USN and sync time of every scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncState {
    /// Watermark of the user's own account
    pub user_data_update_count: Usn,
    /// Last sync time of the user's own account
    pub user_data_last_sync_time: Timestamp,
    /// Watermarks of linked notebooks
    #[serde(default)]
    pub linked_notebook_update_counts: BTreeMap<Guid, Usn>,
    /// Last sync times of linked notebooks
    #[serde(default)]
    pub linked_notebook_last_sync_times: BTreeMap<Guid, Timestamp>,
}

impl LastSyncState {
    /// Watermark of a scope, zero if it was never synchronized
    pub fn update_count(&self, scope: &SyncScope) -> Usn {
        match scope {
            SyncScope::UserOwn => self.user_data_update_count,
            SyncScope::LinkedNotebook(guid) => self
                .linked_notebook_update_counts
                .get(guid)
                .copied()
                .unwrap_or(0),
        }
    }

    /// Last sync time of a scope, zero if it was never synchronized
    pub fn last_sync_time(&self, scope: &SyncScope) -> Timestamp {
        match scope {
            SyncScope::UserOwn => self.user_data_last_sync_time,
            SyncScope::LinkedNotebook(guid) => self
                .linked_notebook_last_sync_times
                .get(guid)
                .copied()
                .unwrap_or(0),
        }
    }

    /// Record a new watermark for a scope
    pub fn set(&mut self, scope: &SyncScope, update_count: Usn, sync_time: Timestamp) {
        match scope {
            SyncScope::UserOwn => {
                self.user_data_update_count = update_count;
                self.user_data_last_sync_time = sync_time;
            }
            SyncScope::LinkedNotebook(guid) => {
                self.linked_notebook_update_counts
                    .insert(guid.clone(), update_count);
                self.linked_notebook_last_sync_times
                    .insert(guid.clone(), sync_time);
            }
        }
    }

    /// Forget a linked notebook
    pub fn remove_linked_notebook(&mut self, guid: &str) {
        self.linked_notebook_update_counts.remove(guid);
        self.linked_notebook_last_sync_times.remove(guid);
    }
}

/// Persistence of [`LastSyncState`]
#[async_trait]
pub trait SyncStateStorage: Send + Sync {
    /// Load the state; a missing state is the default state
    async fn load(&self) -> Result<LastSyncState>;

    /// Replace the persisted state
    async fn save(&self, state: &LastSyncState) -> Result<()>;
}

/// State kept in a JSON file, replaced atomically on save
#[derive(Debug, Clone)]
pub struct FileSyncStateStorage {
    path: PathBuf,
}

impl FileSyncStateStorage {
    /// Create a storage backed by the given file
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SyncStateStorage for FileSyncStateStorage {
    async fn load(&self) -> Result<LastSyncState> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            debug!(path = %self.path.display(), "No sync state yet");
            return Ok(LastSyncState::default());
        }

        let data = fs::read(&self.path).await.map_err(|e| Error::Io {
            message: format!(
                "Failed to read sync state '{}': {}",
                self.path.display(),
                e
            ),
        })?;
        serde_json::from_slice(&data).map_err(|e| Error::Serialization {
            message: format!(
                "Failed to parse sync state '{}': {}",
                self.path.display(),
                e
            ),
        })
    }

    async fn save(&self, state: &LastSyncState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec_pretty(state)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await.map_err(|e| Error::Io {
            message: format!(
                "Failed to write sync state '{}': {}",
                tmp_path.display(),
                e
            ),
        })?;
        fs::rename(&tmp_path, &self.path).await?;

        debug!(
            user_own = state.user_data_update_count,
            linked_notebooks = state.linked_notebook_update_counts.len(),
            "Saved sync state"
        );
        Ok(())
    }
}
