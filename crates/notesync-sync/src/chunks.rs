//! Sync chunk download and on-disk caching
//!
//! Chunks are requested page by page until the scope's server-side update
//! count is reached. Every downloaded chunk is cached under
//! `sync_chunks/<scope>/<first usn>-<high usn>.chunk` so that an interrupted
//! run replays cached chunks instead of requesting the same USN range again.

use crate::paths::scope_dir;
use crate::progress::SyncEventsNotifier;
use async_trait::async_trait;
use notesync_types::{
    Error, LinkedNotebook, NoteStore, RequestContext, Result, SyncChunk, SyncChunkFilter,
    SyncScope, Usn,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHUNK_EXTENSION: &str = "chunk";

/// Cache of downloaded sync chunks
#[async_trait]
pub trait SyncChunksStorage: Send + Sync {
    /// Cached chunks covering a contiguous USN range starting right after
    /// `after_usn`, in order. Chunks below the watermark are ignored.
    async fn fetch_chunks(&self, scope: &SyncScope, after_usn: Usn) -> Result<Vec<SyncChunk>>;

    /// Cache a chunk that was requested with `after_usn`
    async fn put_chunk(&self, scope: &SyncScope, after_usn: Usn, chunk: &SyncChunk) -> Result<()>;

    /// Drop the cached chunks of one scope
    async fn clear(&self, scope: &SyncScope) -> Result<()>;
}

/// Chunk cache on the local file system, encoded with bincode
#[derive(Debug, Clone)]
pub struct FileSyncChunksStorage {
    root: PathBuf,
}

impl FileSyncChunksStorage {
    /// Create a cache rooted at the given directory
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn scope_path(&self, scope: &SyncScope) -> PathBuf {
        self.root.join(scope_dir(scope))
    }

    /// `(first usn, high usn)` encoded in a chunk file name
    fn parse_range(path: &Path) -> Option<(Usn, Usn)> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(CHUNK_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let (first, high) = stem.split_once('-')?;
        Some((first.parse().ok()?, high.parse().ok()?))
    }

    async fn cached_ranges(&self, scope: &SyncScope) -> Result<Vec<(Usn, Usn, PathBuf)>> {
        let dir = self.scope_path(scope);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Io {
                    message: format!("Failed to list chunk cache '{}': {}", dir.display(), e),
                })
            }
        };

        let mut ranges = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some((first, high)) = Self::parse_range(&path) {
                ranges.push((first, high, path));
            }
        }
        ranges.sort_by_key(|(first, high, _)| (*first, *high));
        Ok(ranges)
    }

    async fn read_chunk(path: &Path) -> Result<SyncChunk> {
        let data = fs::read(path).await.map_err(|e| Error::Io {
            message: format!("Failed to read sync chunk '{}': {}", path.display(), e),
        })?;
        let (chunk, _) =
            bincode::serde::decode_from_slice(&data, bincode::config::standard()).map_err(|e| {
                Error::Serialization {
                    message: format!("Failed to decode sync chunk '{}': {}", path.display(), e),
                }
            })?;
        Ok(chunk)
    }
}

#[async_trait]
impl SyncChunksStorage for FileSyncChunksStorage {
    async fn fetch_chunks(&self, scope: &SyncScope, after_usn: Usn) -> Result<Vec<SyncChunk>> {
        let mut chunks = Vec::new();
        let mut expected_first = after_usn + 1;

        for (first, high, path) in self.cached_ranges(scope).await? {
            if first < expected_first {
                continue;
            }
            if first > expected_first {
                debug!(%scope, expected_first, first, "Gap in chunk cache");
                break;
            }

            match Self::read_chunk(&path).await {
                Ok(chunk) => {
                    chunks.push(chunk);
                    expected_first = high + 1;
                }
                Err(e) => {
                    warn!(%scope, path = %path.display(), error = %e, "Discarding unreadable cached chunk");
                    break;
                }
            }
        }

        if !chunks.is_empty() {
            info!(%scope, after_usn, cached = chunks.len(), "Replaying cached sync chunks");
        }
        Ok(chunks)
    }

    async fn put_chunk(&self, scope: &SyncScope, after_usn: Usn, chunk: &SyncChunk) -> Result<()> {
        let Some(high_usn) = chunk.chunk_high_usn else {
            return Ok(());
        };

        let dir = self.scope_path(scope);
        fs::create_dir_all(&dir).await.map_err(|e| Error::Io {
            message: format!("Failed to create chunk cache '{}': {}", dir.display(), e),
        })?;

        let data = bincode::serde::encode_to_vec(chunk, bincode::config::standard()).map_err(
            |e| Error::Serialization {
                message: format!("Failed to encode sync chunk: {}", e),
            },
        )?;

        let path = dir.join(format!("{}-{}.{}", after_usn + 1, high_usn, CHUNK_EXTENSION));
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data).await.map_err(|e| Error::Io {
            message: format!("Failed to write sync chunk '{}': {}", tmp_path.display(), e),
        })?;
        fs::rename(&tmp_path, &path).await?;

        debug!(%scope, first_usn = after_usn + 1, high_usn, "Cached sync chunk");
        Ok(())
    }

    async fn clear(&self, scope: &SyncScope) -> Result<()> {
        let dir = self.scope_path(scope);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(%scope, "Cleared chunk cache");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io {
                message: format!("Failed to clear chunk cache '{}': {}", dir.display(), e),
            }),
        }
    }
}

/// Where chunks of one scope come from
#[derive(Debug, Clone)]
pub enum ChunkSource {
    /// The user's own account
    UserOwn {
        /// Whether this is a full sync
        full_sync: bool,
    },
    /// A linked notebook
    LinkedNotebook {
        /// The linked notebook
        linked_notebook: LinkedNotebook,
        /// Whether this is a full sync
        full_sync: bool,
    },
}

impl ChunkSource {
    /// Scope the chunks belong to
    pub fn scope(&self) -> SyncScope {
        match self {
            Self::UserOwn { .. } => SyncScope::UserOwn,
            Self::LinkedNotebook {
                linked_notebook, ..
            } => SyncScope::from_linked_notebook_guid(linked_notebook.guid.as_ref()),
        }
    }
}

/// Downloads the chunks of a scope, replaying the cache first
pub struct SyncChunksProvider {
    note_store: Arc<dyn NoteStore>,
    storage: Arc<dyn SyncChunksStorage>,
    max_entries: u32,
    notifier: SyncEventsNotifier,
    canceler: CancellationToken,
}

impl SyncChunksProvider {
    /// Create a provider
    pub fn new(
        note_store: Arc<dyn NoteStore>,
        storage: Arc<dyn SyncChunksStorage>,
        max_entries: u32,
        notifier: SyncEventsNotifier,
        canceler: CancellationToken,
    ) -> Self {
        Self {
            note_store,
            storage,
            max_entries,
            notifier,
            canceler,
        }
    }

    /// Every chunk after `after_usn`, in USN order
    pub async fn fetch(
        &self,
        source: &ChunkSource,
        after_usn: Usn,
        ctx: &RequestContext,
    ) -> Result<Vec<SyncChunk>> {
        let scope = source.scope();
        let mut chunks = self
            .storage
            .fetch_chunks(&scope, after_usn)
            .await
            .unwrap_or_else(|e| {
                warn!(%scope, error = %e, "Ignoring chunk cache");
                Vec::new()
            });
        let mut last_usn = chunks
            .last()
            .and_then(|chunk| chunk.chunk_high_usn)
            .unwrap_or(after_usn);
        // A replayed chunk that reached the account's update count leaves
        // nothing to request.
        let mut done = chunks.last().is_some_and(|chunk| {
            chunk
                .chunk_high_usn
                .is_some_and(|high| high >= chunk.update_count)
        });

        while !done {
            if self.canceler.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let chunk = self.request(source, last_usn, ctx).await?;
            let Some(high_usn) = chunk.chunk_high_usn else {
                break;
            };
            if high_usn <= last_usn {
                return Err(Error::remote(format!(
                    "sync chunk after USN {} ends at USN {}",
                    last_usn, high_usn
                )));
            }

            if let Err(e) = self.storage.put_chunk(&scope, last_usn, &chunk).await {
                warn!(%scope, error = %e, "Failed to cache sync chunk");
            }
            self.notifier
                .sync_chunks_download_progress(&scope, high_usn, chunk.update_count, after_usn);

            done = high_usn >= chunk.update_count;
            last_usn = high_usn;
            chunks.push(chunk);
        }

        debug!(%scope, after_usn, last_usn, chunks = chunks.len(), "Sync chunks available");
        self.notifier.sync_chunks_downloaded(&scope);
        Ok(chunks)
    }

    async fn request(
        &self,
        source: &ChunkSource,
        after_usn: Usn,
        ctx: &RequestContext,
    ) -> Result<SyncChunk> {
        match source {
            ChunkSource::UserOwn { full_sync } => {
                self.note_store
                    .get_filtered_sync_chunk(
                        after_usn,
                        self.max_entries,
                        &SyncChunkFilter::user_own(*full_sync),
                        ctx,
                    )
                    .await
            }
            ChunkSource::LinkedNotebook {
                linked_notebook,
                full_sync,
            } => {
                self.note_store
                    .get_linked_notebook_sync_chunk(
                        linked_notebook,
                        after_usn,
                        self.max_entries,
                        *full_sync,
                        ctx,
                    )
                    .await
            }
        }
    }
}
