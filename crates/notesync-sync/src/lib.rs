//! Bidirectional synchronization engine for notesync
//!
//! This crate reconciles a local note store with the remote note service:
//!
//! - **Sync Chunk Pipeline**: Incremental download of remote changes by update sequence number, cached on disk
//! - **Durable Processing**: Crash-resumable application of remote changes backed by per-category journals
//! - **Bounded Downloads**: Full note and resource bodies fetched with a fixed number of requests in flight
//! - **Conflict Resolution**: Deterministic decisions between remote and locally modified items
//! - **Sending**: Upload of local changes with watermark tracking and conflict handling
//! - **Progress Tracking**: Events published to an optional observer
//!
//! # Examples
//!
//! ```rust,no_run
//! use notesync_sync::{SyncOptions, Synchronizer};
//! use notesync_types::{Account, LocalStore};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(
//! #     synchronizer: Synchronizer,
//! #     local_store: Arc<dyn LocalStore>,
//! #     account: Account,
//! # ) -> notesync_types::Result<()> {
//! let (sync, mut events) = synchronizer.synchronize_account(
//!     account,
//!     local_store,
//!     CancellationToken::new(),
//!     SyncOptions::default(),
//!     None,
//! );
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! let result = sync.await?;
//! println!("Sent {} notes", result.send_status.total_successfully_sent_notes);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod bounded;
pub mod chunks;
pub mod conflict;
pub mod context;
pub mod downloader;
pub mod engine;
pub mod expunger;
pub mod options;
pub mod paths;
pub mod pending;
pub mod processors;
pub mod progress;
pub mod sender;
pub mod sync_state;
pub mod synchronizer;

mod store;

pub use bounded::{BoundedDownloader, NoteFullDataDownloader, ResourceFullDataDownloader};
pub use chunks::{ChunkSource, FileSyncChunksStorage, SyncChunksProvider, SyncChunksStorage};
pub use conflict::{
    ConflictResolution, ConflictResolutionKind, ConflictResolver, SimpleConflictResolver,
};
pub use context::SyncContext;
pub use downloader::{DownloadResult, Downloader, ScopeDownloadResult};
pub use engine::{AccountSynchronizer, SyncResult};
pub use expunger::{FullSyncStaleDataExpunger, ObservedGuids, StaleDataExpungeStatus};
pub use options::SyncOptions;
pub use pending::{
    FilePendingStateStore, MemoryPendingStateStore, PendingEntry, PendingState, PendingStateStore,
};
pub use progress::{SyncEvent, SyncEventsNotifier, SyncEventsReceiver, SyncPhase, SyncProgress};
pub use sender::Sender;
pub use sync_state::{FileSyncStateStorage, LastSyncState, SyncStateStorage};
pub use synchronizer::Synchronizer;
