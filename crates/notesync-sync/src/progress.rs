//! Progress events emitted while an account is synchronized

use chrono::{DateTime, Utc};
use notesync_types::{
    Error, Guid, ItemKind, LocalId, StopSynchronizationError, SyncChunksDataCounters, SyncScope,
    Usn,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Receiving end of the event stream of one sync run
pub type SyncEventsReceiver = mpsc::UnboundedReceiver<SyncEvent>;

/// Snapshot of a running synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Id of the sync run
    pub operation_id: uuid::Uuid,
    /// Current phase
    pub phase: SyncPhase,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Full notes downloaded so far
    pub notes_downloaded: u64,
    /// Notes scheduled for download
    pub notes_total: u64,
    /// Full resources downloaded so far
    pub resources_downloaded: u64,
    /// Resources scheduled for download
    pub resources_total: u64,
    /// Items accepted by the remote service
    pub items_sent: u64,
    /// Items the remote service rejected
    pub items_failed_to_send: u64,
    /// Scopes whose download failed
    pub scopes_failed: u64,
}

/// Synchronization phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Preparing the run
    Initializing,
    /// Obtaining credentials
    Authenticating,
    /// Checking the remote protocol version
    CheckingProtocolVersion,
    /// Downloading and applying remote changes
    Downloading,
    /// Uploading local changes
    Sending,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped by the caller
    Cancelled,
}

impl SyncProgress {
    /// Create a new snapshot
    pub fn new(operation_id: uuid::Uuid) -> Self {
        Self {
            operation_id,
            phase: SyncPhase::Initializing,
            started_at: Utc::now(),
            notes_downloaded: 0,
            notes_total: 0,
            resources_downloaded: 0,
            resources_total: 0,
            items_sent: 0,
            items_failed_to_send: 0,
            scopes_failed: 0,
        }
    }

    /// Whether the run reached a terminal phase
    pub fn is_complete(&self) -> bool {
        matches!(
            self.phase,
            SyncPhase::Completed | SyncPhase::Failed | SyncPhase::Cancelled
        )
    }

    /// Percentage of scheduled downloads that finished
    pub fn download_progress(&self) -> f64 {
        let total = self.notes_total + self.resources_total;
        if total > 0 {
            (self.notes_downloaded + self.resources_downloaded) as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }
}

/// Event emitted by the synchronizer
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Phase changed
    PhaseChanged(SyncPhase),
    /// A sync chunk of a scope was downloaded
    SyncChunksDownloadProgress {
        /// Scope of the chunks
        scope: SyncScope,
        /// Highest USN downloaded so far
        highest_downloaded_usn: Usn,
        /// Highest USN of the scope on the server
        highest_server_usn: Usn,
        /// Watermark the download started from
        last_previous_usn: Usn,
    },
    /// Every sync chunk of a scope is available
    SyncChunksDownloaded {
        /// Scope of the chunks
        scope: SyncScope,
    },
    /// Items carried by the sync chunks of a scope were applied
    SyncChunksDataProcessed {
        /// Scope of the chunks
        scope: SyncScope,
        /// Per-category counters
        counters: SyncChunksDataCounters,
    },
    /// Linked notebooks known locally are about to be synchronized
    LinkedNotebooksDiscovered {
        /// Guids of the linked notebooks
        guids: Vec<Guid>,
    },
    /// Full note downloads progressed
    NotesDownloadProgress {
        /// Scope of the notes
        scope: SyncScope,
        /// Notes handled so far
        downloaded: u64,
        /// Notes to handle
        total: u64,
    },
    /// Full resource downloads progressed
    ResourcesDownloadProgress {
        /// Scope of the resources
        scope: SyncScope,
        /// Resources handled so far
        downloaded: u64,
        /// Resources to handle
        total: u64,
    },
    /// A local item was accepted by the remote service
    ItemSent {
        /// Kind of the item
        kind: ItemKind,
        /// Local id of the item
        local_id: LocalId,
        /// Guid assigned by the remote service
        guid: Guid,
    },
    /// A local item could not be sent
    ItemFailedToSend {
        /// Kind of the item
        kind: ItemKind,
        /// Local id of the item
        local_id: LocalId,
        /// Why it failed
        error: Error,
    },
    /// Downloading a scope failed; other scopes continue
    ScopeFailed {
        /// The failed scope
        scope: SyncScope,
        /// Why it failed
        error: Error,
    },
    /// The run has to halt
    Stopped(StopSynchronizationError),
    /// Sync completed
    Completed(SyncProgress),
    /// Sync failed
    Failed(String),
}

/// Fans progress out to the caller through an unbounded channel.
///
/// Sending never blocks and a dropped receiver is ignored, so reporting can
/// sit on any code path of the engine.
#[derive(Debug, Clone)]
pub struct SyncEventsNotifier {
    progress: Arc<RwLock<SyncProgress>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncEventsNotifier {
    /// Create a notifier together with the receiving end of its events
    pub fn new(operation_id: uuid::Uuid) -> (Self, SyncEventsReceiver) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let progress = Arc::new(RwLock::new(SyncProgress::new(operation_id)));
        (Self { progress, event_tx }, event_rx)
    }

    /// Get the current progress
    pub async fn get_progress(&self) -> SyncProgress {
        self.progress.read().await.clone()
    }

    /// Update the current phase
    pub async fn set_phase(&self, phase: SyncPhase) {
        self.progress.write().await.phase = phase;
        debug!(?phase, "Sync phase changed");
        let _ = self.event_tx.send(SyncEvent::PhaseChanged(phase));
    }

    /// Report a downloaded sync chunk
    pub fn sync_chunks_download_progress(
        &self,
        scope: &SyncScope,
        highest_downloaded_usn: Usn,
        highest_server_usn: Usn,
        last_previous_usn: Usn,
    ) {
        let _ = self.event_tx.send(SyncEvent::SyncChunksDownloadProgress {
            scope: scope.clone(),
            highest_downloaded_usn,
            highest_server_usn,
            last_previous_usn,
        });
    }

    /// Report that every sync chunk of a scope is available
    pub fn sync_chunks_downloaded(&self, scope: &SyncScope) {
        let _ = self.event_tx.send(SyncEvent::SyncChunksDownloaded {
            scope: scope.clone(),
        });
    }

    /// Report the counters of the chunk-carried categories of a scope
    pub fn sync_chunks_data_processed(&self, scope: &SyncScope, counters: SyncChunksDataCounters) {
        let _ = self.event_tx.send(SyncEvent::SyncChunksDataProcessed {
            scope: scope.clone(),
            counters,
        });
    }

    /// Report the linked notebooks about to be synchronized
    pub fn linked_notebooks_discovered(&self, guids: Vec<Guid>) {
        let _ = self
            .event_tx
            .send(SyncEvent::LinkedNotebooksDiscovered { guids });
    }

    /// Announce notes about to be downloaded
    pub async fn notes_scheduled(&self, count: u64) {
        self.progress.write().await.notes_total += count;
    }

    /// Report a handled note
    pub async fn note_downloaded(&self, scope: &SyncScope, downloaded: u64, total: u64) {
        self.progress.write().await.notes_downloaded += 1;
        let _ = self.event_tx.send(SyncEvent::NotesDownloadProgress {
            scope: scope.clone(),
            downloaded,
            total,
        });
    }

    /// Announce resources about to be downloaded
    pub async fn resources_scheduled(&self, count: u64) {
        self.progress.write().await.resources_total += count;
    }

    /// Report a handled resource
    pub async fn resource_downloaded(&self, scope: &SyncScope, downloaded: u64, total: u64) {
        self.progress.write().await.resources_downloaded += 1;
        let _ = self.event_tx.send(SyncEvent::ResourcesDownloadProgress {
            scope: scope.clone(),
            downloaded,
            total,
        });
    }

    /// Report an item accepted by the remote service
    pub async fn item_sent(&self, kind: ItemKind, local_id: LocalId, guid: Guid) {
        self.progress.write().await.items_sent += 1;
        let _ = self.event_tx.send(SyncEvent::ItemSent {
            kind,
            local_id,
            guid,
        });
    }

    /// Report an item the remote service rejected
    pub async fn item_failed_to_send(&self, kind: ItemKind, local_id: LocalId, error: Error) {
        self.progress.write().await.items_failed_to_send += 1;
        let _ = self.event_tx.send(SyncEvent::ItemFailedToSend {
            kind,
            local_id,
            error,
        });
    }

    /// Report a failed scope
    pub async fn scope_failed(&self, scope: &SyncScope, error: Error) {
        self.progress.write().await.scopes_failed += 1;
        let _ = self.event_tx.send(SyncEvent::ScopeFailed {
            scope: scope.clone(),
            error,
        });
    }

    /// Report a condition halting the run
    pub fn stopped(&self, error: StopSynchronizationError) {
        let _ = self.event_tx.send(SyncEvent::Stopped(error));
    }

    /// Report sync completed
    pub async fn completed(&self) {
        let progress = {
            let mut progress = self.progress.write().await;
            progress.phase = SyncPhase::Completed;
            progress.clone()
        };

        info!(
            notes = progress.notes_downloaded,
            resources = progress.resources_downloaded,
            sent = progress.items_sent,
            "Sync completed"
        );
        let _ = self.event_tx.send(SyncEvent::Completed(progress));
    }

    /// Report sync cancelled
    pub async fn cancelled(&self) {
        self.set_phase(SyncPhase::Cancelled).await;
    }

    /// Report sync failed
    pub async fn failed(&self, error: String) {
        self.progress.write().await.phase = SyncPhase::Failed;
        let _ = self.event_tx.send(SyncEvent::Failed(error));
    }
}
