//! Public entry point

use crate::conflict::{ConflictResolver, SimpleConflictResolver};
use crate::context::SyncContext;
use crate::engine::{AccountSynchronizer, SyncResult};
use crate::options::SyncOptions;
use crate::progress::{SyncEventsNotifier, SyncEventsReceiver, SyncPhase};
use futures::future::{BoxFuture, FutureExt};
use notesync_types::{
    Account, AuthenticationProvider, Error, LocalStore, NoteStoreProvider, Result, UserStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Synchronizes accounts against the remote note service
#[derive(Clone)]
pub struct Synchronizer {
    auth_provider: Arc<dyn AuthenticationProvider>,
    note_store_provider: Arc<dyn NoteStoreProvider>,
    user_store: Arc<dyn UserStore>,
}

impl Synchronizer {
    /// Create a synchronizer talking to the given remote collaborators
    pub fn new(
        auth_provider: Arc<dyn AuthenticationProvider>,
        note_store_provider: Arc<dyn NoteStoreProvider>,
        user_store: Arc<dyn UserStore>,
    ) -> Self {
        Self {
            auth_provider,
            note_store_provider,
            user_store,
        }
    }

    /// Synchronize one account.
    ///
    /// Returns the future performing the synchronization together with the
    /// receiving end of its progress events. Nothing happens until the
    /// future is polled. Without a `conflict_resolver` the
    /// [`SimpleConflictResolver`] is used.
    pub fn synchronize_account(
        &self,
        account: Account,
        local_store: Arc<dyn LocalStore>,
        canceler: CancellationToken,
        options: SyncOptions,
        conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    ) -> (BoxFuture<'static, Result<SyncResult>>, SyncEventsReceiver) {
        let (notifier, events) = SyncEventsNotifier::new(uuid::Uuid::new_v4());
        let resolver =
            conflict_resolver.unwrap_or_else(|| Arc::new(SimpleConflictResolver::new()));
        let ctx = SyncContext::with_file_storage(
            account,
            Arc::clone(&self.auth_provider),
            Arc::clone(&self.note_store_provider),
            local_store,
            resolver,
            options,
            notifier.clone(),
            canceler,
        );
        let synchronizer = AccountSynchronizer::new(ctx, Arc::clone(&self.user_store));

        let run = async move {
            notifier.set_phase(SyncPhase::Initializing).await;
            let result = synchronizer.synchronize().await;
            match &result {
                Ok(_) => notifier.completed().await,
                Err(Error::Cancelled) => {
                    info!("Sync cancelled");
                    notifier.cancelled().await;
                }
                Err(e) => {
                    error!(error = %e, "Sync failed");
                    notifier.failed(e.to_string()).await;
                }
            }
            result
        };

        (run.boxed(), events)
    }
}
