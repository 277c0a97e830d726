//! Durable journal of items that are not yet fully processed
//!
//! Every category of every scope has its own append-only JSON-lines journal
//! under `last_sync_data/`. A processor records each item it receives before
//! touching the local store and drops the record once the item is applied,
//! so an interrupted run picks up exactly the items it did not finish.
//! Journals are replayed and compacted when loaded and deleted once their
//! category drains.

use crate::paths::{journal_file_name, scope_dir};
use async_trait::async_trait;
use notesync_types::{Error, Guid, ItemKind, Result, SyncScope, Usn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Where an item is in its processing lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    /// Full data still has to be downloaded
    PendingDownload,
    /// Data is available but not yet written to the local store
    PendingProcess,
    /// The item still has to be removed from the local store
    PendingExpunge,
}

/// Journal record of one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Lifecycle state
    pub state: PendingState,
    /// USN the item was received with
    pub usn: Option<Usn>,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Item data as received, absent for expunges
    pub item: Option<serde_json::Value>,
}

impl PendingEntry {
    /// Entry for an item awaiting download or processing
    pub fn item(state: PendingState, usn: Option<Usn>, item: serde_json::Value) -> Self {
        Self {
            state,
            usn,
            retry_count: 0,
            item: Some(item),
        }
    }

    /// Entry for a guid awaiting expunge
    pub fn expunge() -> Self {
        Self {
            state: PendingState::PendingExpunge,
            usn: None,
            retry_count: 0,
            item: None,
        }
    }
}

/// Storage of pending-item journals
#[async_trait]
pub trait PendingStateStore: Send + Sync {
    /// Entries of one category, by guid
    async fn load(&self, scope: &SyncScope, kind: ItemKind) -> Result<BTreeMap<Guid, PendingEntry>>;

    /// Record or replace the entry of a guid
    async fn upsert(&self, scope: &SyncScope, kind: ItemKind, guid: &str, entry: &PendingEntry)
        -> Result<()>;

    /// Drop the entry of a guid
    async fn remove(&self, scope: &SyncScope, kind: ItemKind, guid: &str) -> Result<()>;

    /// Drop every entry of one category
    async fn clear(&self, scope: &SyncScope, kind: ItemKind) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Upsert { guid: Guid, entry: PendingEntry },
    Remove { guid: Guid },
}

/// JSON-lines journals below an account's `last_sync_data/` directory
#[derive(Debug)]
pub struct FilePendingStateStore {
    root: PathBuf,
    // Serializes appends so concurrent item tasks never interleave lines.
    write_lock: tokio::sync::Mutex<()>,
}

impl FilePendingStateStore {
    /// Create a store rooted at the given directory
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn journal_path(&self, scope: &SyncScope, kind: ItemKind) -> PathBuf {
        self.root.join(scope_dir(scope)).join(journal_file_name(kind))
    }

    async fn append(&self, path: &Path, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Error::Io {
                message: format!("Failed to create journal directory '{}': {}", parent.display(), e),
            })?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::Io {
                message: format!("Failed to open journal '{}': {}", path.display(), e),
            })?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    fn replay(path: &Path, content: &str) -> BTreeMap<Guid, PendingEntry> {
        let mut entries = BTreeMap::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(JournalRecord::Upsert { guid, entry }) => {
                    entries.insert(guid, entry);
                }
                Ok(JournalRecord::Remove { guid }) => {
                    entries.remove(&guid);
                }
                // A torn trailing line is what an interrupted append leaves behind.
                Err(e) => {
                    warn!(journal = %path.display(), line = index + 1, error = %e, "Skipping unreadable journal line");
                }
            }
        }
        entries
    }

    async fn compact(&self, path: &Path, entries: &BTreeMap<Guid, PendingEntry>) -> Result<()> {
        let mut content = Vec::new();
        for (guid, entry) in entries {
            serde_json::to_writer(
                &mut content,
                &JournalRecord::Upsert {
                    guid: guid.clone(),
                    entry: entry.clone(),
                },
            )?;
            content.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let tmp_path = path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, content).await.map_err(|e| Error::Io {
            message: format!("Failed to write journal '{}': {}", tmp_path.display(), e),
        })?;
        fs::rename(&tmp_path, path).await.map_err(|e| Error::Io {
            message: format!("Failed to replace journal '{}': {}", path.display(), e),
        })?;
        Ok(())
    }
}

#[async_trait]
impl PendingStateStore for FilePendingStateStore {
    async fn load(&self, scope: &SyncScope, kind: ItemKind) -> Result<BTreeMap<Guid, PendingEntry>> {
        let path = self.journal_path(scope, kind);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&path).await.map_err(|e| Error::Io {
            message: format!("Failed to read journal '{}': {}", path.display(), e),
        })?;
        let entries = Self::replay(&path, &content);

        if entries.is_empty() {
            self.clear(scope, kind).await?;
        } else {
            self.compact(&path, &entries).await?;
        }

        debug!(%scope, %kind, pending = entries.len(), "Loaded pending journal");
        Ok(entries)
    }

    async fn upsert(
        &self,
        scope: &SyncScope,
        kind: ItemKind,
        guid: &str,
        entry: &PendingEntry,
    ) -> Result<()> {
        let record = JournalRecord::Upsert {
            guid: guid.to_string(),
            entry: entry.clone(),
        };
        self.append(&self.journal_path(scope, kind), &record).await
    }

    async fn remove(&self, scope: &SyncScope, kind: ItemKind, guid: &str) -> Result<()> {
        let record = JournalRecord::Remove {
            guid: guid.to_string(),
        };
        self.append(&self.journal_path(scope, kind), &record).await
    }

    async fn clear(&self, scope: &SyncScope, kind: ItemKind) -> Result<()> {
        let path = self.journal_path(scope, kind);
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io {
                message: format!("Failed to remove journal '{}': {}", path.display(), e),
            }),
        }
    }
}

/// In-memory journals, for callers that do not need crash resumption
#[derive(Debug, Default)]
pub struct MemoryPendingStateStore {
    entries: Mutex<HashMap<(SyncScope, ItemKind), BTreeMap<Guid, PendingEntry>>>,
}

impl MemoryPendingStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut HashMap<(SyncScope, ItemKind), BTreeMap<Guid, PendingEntry>>) -> R,
    ) -> R {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut entries)
    }
}

#[async_trait]
impl PendingStateStore for MemoryPendingStateStore {
    async fn load(&self, scope: &SyncScope, kind: ItemKind) -> Result<BTreeMap<Guid, PendingEntry>> {
        Ok(self.with_entries(|entries| {
            entries
                .get(&(scope.clone(), kind))
                .cloned()
                .unwrap_or_default()
        }))
    }

    async fn upsert(
        &self,
        scope: &SyncScope,
        kind: ItemKind,
        guid: &str,
        entry: &PendingEntry,
    ) -> Result<()> {
        self.with_entries(|entries| {
            entries
                .entry((scope.clone(), kind))
                .or_default()
                .insert(guid.to_string(), entry.clone());
        });
        Ok(())
    }

    async fn remove(&self, scope: &SyncScope, kind: ItemKind, guid: &str) -> Result<()> {
        self.with_entries(|entries| {
            if let Some(category) = entries.get_mut(&(scope.clone(), kind)) {
                category.remove(guid);
            }
        });
        Ok(())
    }

    async fn clear(&self, scope: &SyncScope, kind: ItemKind) -> Result<()> {
        self.with_entries(|entries| {
            entries.remove(&(scope.clone(), kind));
        });
        Ok(())
    }
}
