//! Collaborators shared by the components of one account synchronization

use crate::chunks::{FileSyncChunksStorage, SyncChunksStorage};
use crate::conflict::ConflictResolver;
use crate::options::SyncOptions;
use crate::paths::AccountPaths;
use crate::pending::{FilePendingStateStore, PendingStateStore};
use crate::processors::ProcessorContext;
use crate::progress::SyncEventsNotifier;
use crate::sync_state::{FileSyncStateStorage, SyncStateStorage};
use notesync_types::{Account, AuthenticationProvider, LocalStore, NoteStoreProvider, SyncScope};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the downloader, the sender and the account synchronizer need
#[derive(Clone)]
pub struct SyncContext {
    /// Account being synchronized
    pub account: Account,
    /// Source of authentication tokens
    pub auth_provider: Arc<dyn AuthenticationProvider>,
    /// Source of note stores
    pub note_store_provider: Arc<dyn NoteStoreProvider>,
    /// Local item store
    pub local_store: Arc<dyn LocalStore>,
    /// Conflict resolver
    pub resolver: Arc<dyn ConflictResolver>,
    /// Cache of downloaded sync chunks
    pub chunks_storage: Arc<dyn SyncChunksStorage>,
    /// Pending-item journals
    pub pending: Arc<dyn PendingStateStore>,
    /// Per-scope watermarks
    pub sync_state_storage: Arc<dyn SyncStateStorage>,
    /// Runtime options
    pub options: SyncOptions,
    /// Progress events
    pub notifier: SyncEventsNotifier,
    /// Caller's cancellation token
    pub canceler: CancellationToken,
}

impl SyncContext {
    /// Context persisting its state under the account's directory of
    /// `options.persistence_root`
    #[allow(clippy::too_many_arguments)]
    pub fn with_file_storage(
        account: Account,
        auth_provider: Arc<dyn AuthenticationProvider>,
        note_store_provider: Arc<dyn NoteStoreProvider>,
        local_store: Arc<dyn LocalStore>,
        resolver: Arc<dyn ConflictResolver>,
        options: SyncOptions,
        notifier: SyncEventsNotifier,
        canceler: CancellationToken,
    ) -> Self {
        let paths = AccountPaths::new(&options.persistence_root, &account);
        Self {
            chunks_storage: Arc::new(FileSyncChunksStorage::new(paths.sync_chunks_root())),
            pending: Arc::new(FilePendingStateStore::new(paths.last_sync_data_root())),
            sync_state_storage: Arc::new(FileSyncStateStorage::new(paths.sync_state_file())),
            account,
            auth_provider,
            note_store_provider,
            local_store,
            resolver,
            options,
            notifier,
            canceler,
        }
    }

    pub(crate) fn processor_context(&self, scope: SyncScope) -> ProcessorContext {
        ProcessorContext {
            local_store: Arc::clone(&self.local_store),
            resolver: Arc::clone(&self.resolver),
            pending: Arc::clone(&self.pending),
            notifier: self.notifier.clone(),
            canceler: self.canceler.clone(),
            scope,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.canceler.is_cancelled()
    }
}
