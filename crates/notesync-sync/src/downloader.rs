//! Download side of an account synchronization
//!
//! The user's own account is downloaded first: its chunks carry the linked
//! notebooks, which are then downloaded concurrently, each with its own
//! watermark. Within a scope the categories are applied in dependency
//! order: linked notebooks, then notebooks, tags and saved searches
//! together, then notes, then standalone resources. A full sync finishes
//! with a stale data pass; the whole download finishes with the cleanup of
//! linked notebook tags no note refers to.

use crate::chunks::{ChunkSource, SyncChunksProvider};
use crate::context::SyncContext;
use crate::expunger::{FullSyncStaleDataExpunger, ObservedGuids, StaleDataExpungeStatus};
use crate::processors::{DurableProcessor, NotesProcessor, ResourcesProcessor};
use crate::progress::SyncPhase;
use crate::store;
use crate::sync_state::LastSyncState;
use futures::future::join_all;
use notesync_types::{
    AuthInfo, AuthMode, DownloadItemsStatus, DownloadNotesStatus, DownloadResourcesStatus, Error,
    Guid, GuidFailure, Item, ItemFailure, ItemKind, LinkedNotebook, ListFilter, Merge, NoteStore,
    Notebook, RequestContext, Result, SavedSearch, StopSynchronizationError, SyncChunk,
    SyncChunksDataCounters, SyncItem, SyncScope, SyncState, Tag, Timestamp, Usn,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of downloading one scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDownloadResult {
    /// Whether the scope was downloaded from scratch
    pub full_sync: bool,
    /// Counters of the chunk-carried categories
    pub sync_chunks_data_counters: SyncChunksDataCounters,
    /// Chunk-carried items that failed to be applied
    pub failed_items: Vec<ItemFailure<Item>>,
    /// Chunk-carried expunges that failed
    pub failed_expunges: Vec<GuidFailure>,
    /// Notes
    pub download_notes_status: DownloadNotesStatus,
    /// Standalone resources
    pub download_resources_status: DownloadResourcesStatus,
    /// Stale data pass of a full sync
    pub stale_data_expunge_status: StaleDataExpungeStatus,
    /// Linked notebooks the remote service expunged
    pub expunged_linked_notebooks: BTreeSet<Guid>,
    /// Watermark reached by this scope
    pub update_count: Usn,
    /// Set when the run must halt
    pub stop_synchronization_error: Option<StopSynchronizationError>,
}

impl Merge for ScopeDownloadResult {
    fn merge(&mut self, other: &Self) {
        self.full_sync |= other.full_sync;
        self.sync_chunks_data_counters
            .merge(&other.sync_chunks_data_counters);
        self.failed_items.extend(other.failed_items.iter().cloned());
        self.failed_expunges
            .extend(other.failed_expunges.iter().cloned());
        self.download_notes_status
            .merge(&other.download_notes_status);
        self.download_resources_status
            .merge(&other.download_resources_status);
        self.stale_data_expunge_status
            .merge(&other.stale_data_expunge_status);
        self.expunged_linked_notebooks
            .extend(other.expunged_linked_notebooks.iter().cloned());
        self.update_count = self.update_count.max(other.update_count);
        self.stop_synchronization_error
            .merge(&other.stop_synchronization_error);
    }
}

impl ScopeDownloadResult {
    fn stopped(error: StopSynchronizationError) -> Self {
        Self {
            stop_synchronization_error: Some(error),
            ..Default::default()
        }
    }

    fn fold<T: SyncItem>(&mut self, chunks: &[SyncChunk], status: DownloadItemsStatus<T>) {
        self.stop_synchronization_error
            .merge(&status.stop_synchronization_error);
        if let Some(counters) = self.sync_chunks_data_counters.counters_mut(T::KIND) {
            for chunk in chunks {
                counters.total += T::from_chunk(chunk).len() as u64;
                counters.total_expunged += T::expunged_in_chunk(chunk).len() as u64;
            }
            status.fold_into(counters, &mut self.failed_items, &mut self.failed_expunges);
        }
    }
}

/// Outcome of downloading an account with its linked notebooks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    /// The user's own account
    pub user_own_result: ScopeDownloadResult,
    /// Linked notebooks that were downloaded
    pub linked_notebook_results: BTreeMap<Guid, ScopeDownloadResult>,
    /// Linked notebooks whose download failed
    pub linked_notebook_errors: BTreeMap<Guid, Error>,
    /// Cleanup of unused linked notebook tags
    pub unused_tags_expunge_status: StaleDataExpungeStatus,
    /// Watermarks after the download
    pub sync_state: LastSyncState,
}

impl DownloadResult {
    /// First stop error of any scope
    pub fn stop_synchronization_error(&self) -> Option<StopSynchronizationError> {
        self.user_own_result.stop_synchronization_error.or_else(|| {
            self.linked_notebook_results
                .values()
                .find_map(|result| result.stop_synchronization_error)
        })
    }
}

impl Merge for DownloadResult {
    fn merge(&mut self, other: &Self) {
        self.user_own_result.merge(&other.user_own_result);
        for (guid, result) in &other.linked_notebook_results {
            self.linked_notebook_results
                .entry(guid.clone())
                .or_default()
                .merge(result);
        }
        for (guid, error) in &other.linked_notebook_errors {
            self.linked_notebook_errors
                .entry(guid.clone())
                .or_insert_with(|| error.clone());
        }
        self.unused_tags_expunge_status
            .merge(&other.unused_tags_expunge_status);
        self.sync_state = other.sync_state.clone();
    }
}

/// A scope result together with the watermark it earned
struct ScopeOutcome {
    result: ScopeDownloadResult,
    watermark: Option<(Usn, Timestamp)>,
}

impl ScopeOutcome {
    fn stopped(error: StopSynchronizationError) -> Self {
        Self {
            result: ScopeDownloadResult::stopped(error),
            watermark: None,
        }
    }
}

/// Whether a scope must be downloaded from scratch
pub(crate) fn is_full_sync(
    last_update_count: Usn,
    last_sync_time: Timestamp,
    remote: &SyncState,
) -> bool {
    (last_update_count == 0 && last_sync_time == 0) || remote.full_sync_before > last_sync_time
}

/// Downloads remote changes into the local store
pub struct Downloader {
    ctx: SyncContext,
}

impl Downloader {
    /// Create a downloader
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Download the account and its linked notebooks
    pub async fn download(&self, auth: &AuthInfo, auth_mode: AuthMode) -> Result<DownloadResult> {
        self.ctx.notifier.set_phase(SyncPhase::Downloading).await;
        let mut sync_state = self.ctx.sync_state_storage.load().await?;
        let mut result = DownloadResult::default();

        // Phase 1: the user's own account
        let note_store = self.ctx.note_store_provider.user_own_note_store(auth)?;
        let request_ctx = self.ctx.options.request_context(&auth.auth_token);
        let user_own = self
            .download_scope(note_store, &request_ctx, None, &sync_state)
            .await?;
        if let Some((update_count, sync_time)) = user_own.watermark {
            sync_state.set(&SyncScope::UserOwn, update_count, sync_time);
            self.ctx.sync_state_storage.save(&sync_state).await?;
        }
        result.user_own_result = user_own.result;

        if let Some(stop) = result.user_own_result.stop_synchronization_error {
            warn!(?stop, "User's own account download stopped");
            self.ctx.notifier.stopped(stop);
            result.sync_state = sync_state;
            return Ok(result);
        }

        // Phase 2: linked notebooks gone from the account
        for guid in result.user_own_result.expunged_linked_notebooks.clone() {
            self.forget_linked_notebook(&guid, &mut sync_state).await?;
        }

        // Phase 3: linked notebooks
        let linked_notebooks: Vec<LinkedNotebook> =
            store::list::<LinkedNotebook>(self.ctx.local_store.as_ref(), &ListFilter::default())
                .await?
                .into_iter()
                .filter(|linked_notebook| linked_notebook.guid.is_some())
                .collect();
        self.ctx.notifier.linked_notebooks_discovered(
            linked_notebooks
                .iter()
                .filter_map(|linked_notebook| linked_notebook.guid.clone())
                .collect(),
        );

        let snapshot = sync_state.clone();
        let outcomes = join_all(linked_notebooks.into_iter().map(|linked_notebook| {
            let snapshot = &snapshot;
            async move {
                let guid = linked_notebook.guid.clone().unwrap_or_default();
                let outcome = self
                    .download_linked_notebook(linked_notebook, auth_mode, snapshot)
                    .await;
                (guid, outcome)
            }
        }))
        .await;

        let mut cancelled = false;
        for (guid, outcome) in outcomes {
            let scope = SyncScope::LinkedNotebook(guid.clone());
            match outcome {
                Ok(outcome) => {
                    if let Some((update_count, sync_time)) = outcome.watermark {
                        sync_state.set(&scope, update_count, sync_time);
                    }
                    if let Some(stop) = outcome.result.stop_synchronization_error {
                        self.ctx.notifier.stopped(stop);
                    }
                    result.linked_notebook_results.insert(guid, outcome.result);
                }
                Err(Error::Cancelled) => cancelled = true,
                Err(e) => {
                    error!(linked_notebook = %guid, error = %e, "Linked notebook download failed");
                    self.ctx.notifier.scope_failed(&scope, e.clone()).await;
                    result.linked_notebook_errors.insert(guid, e);
                }
            }
        }
        self.ctx.sync_state_storage.save(&sync_state).await?;
        result.sync_state = sync_state;

        if cancelled || self.ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Phase 4: linked notebook tags nothing refers to anymore
        if result.stop_synchronization_error().is_none() {
            let expunger = FullSyncStaleDataExpunger::new(
                Arc::clone(&self.ctx.local_store),
                self.ctx.canceler.clone(),
            );
            result.unused_tags_expunge_status =
                expunger.expunge_unused_linked_notebook_tags().await?;
        }

        info!(
            linked_notebooks = result.linked_notebook_results.len(),
            failed_linked_notebooks = result.linked_notebook_errors.len(),
            "Download finished"
        );
        Ok(result)
    }

    async fn download_linked_notebook(
        &self,
        linked_notebook: LinkedNotebook,
        auth_mode: AuthMode,
        sync_state: &LastSyncState,
    ) -> Result<ScopeOutcome> {
        let authenticated = async {
            let auth = self
                .ctx
                .auth_provider
                .authenticate_to_linked_notebook(&self.ctx.account, &linked_notebook, auth_mode)
                .await?;
            let note_store = self
                .ctx
                .note_store_provider
                .linked_notebook_note_store(&linked_notebook, &auth)?;
            Ok::<_, Error>((auth, note_store))
        };

        let (auth, note_store) = match authenticated.await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                return match e.stop_synchronization_error() {
                    Some(stop) => Ok(ScopeOutcome::stopped(stop)),
                    None => Err(e),
                }
            }
        };

        let request_ctx = self.ctx.options.request_context(&auth.auth_token);
        self.download_scope(note_store, &request_ctx, Some(linked_notebook), sync_state)
            .await
    }

    async fn forget_linked_notebook(
        &self,
        guid: &Guid,
        sync_state: &mut LastSyncState,
    ) -> Result<()> {
        let scope = SyncScope::LinkedNotebook(guid.clone());
        info!(linked_notebook = %guid, "Removing data of expunged linked notebook");

        let expunger = FullSyncStaleDataExpunger::new(
            Arc::clone(&self.ctx.local_store),
            self.ctx.canceler.clone(),
        );
        expunger.expunge_scope(&scope).await?;

        for kind in ItemKind::ALL {
            self.ctx.pending.clear(&scope, kind).await?;
        }
        if let Err(e) = self.ctx.chunks_storage.clear(&scope).await {
            warn!(linked_notebook = %guid, error = %e, "Failed to clear sync chunks");
        }
        self.ctx.auth_provider.clear_linked_notebook_cache(guid);
        sync_state.remove_linked_notebook(guid);
        Ok(())
    }

    /// Download one scope; stop errors end up in the result, not in `Err`
    async fn download_scope(
        &self,
        note_store: Arc<dyn NoteStore>,
        request_ctx: &RequestContext,
        linked_notebook: Option<LinkedNotebook>,
        sync_state: &LastSyncState,
    ) -> Result<ScopeOutcome> {
        match self
            .run_scope(note_store, request_ctx, linked_notebook, sync_state)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => match e.stop_synchronization_error() {
                Some(stop) => Ok(ScopeOutcome::stopped(stop)),
                None => Err(e),
            },
        }
    }

    async fn run_scope(
        &self,
        note_store: Arc<dyn NoteStore>,
        request_ctx: &RequestContext,
        linked_notebook: Option<LinkedNotebook>,
        sync_state: &LastSyncState,
    ) -> Result<ScopeOutcome> {
        let scope = SyncScope::from_linked_notebook_guid(
            linked_notebook
                .as_ref()
                .and_then(|linked_notebook| linked_notebook.guid.as_ref()),
        );
        if self.ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let remote_state = match &linked_notebook {
            None => note_store.get_sync_state(request_ctx).await?,
            Some(linked_notebook) => {
                note_store
                    .get_linked_notebook_sync_state(linked_notebook, request_ctx)
                    .await?
            }
        };
        let last_update_count = sync_state.update_count(&scope);
        let full_sync = is_full_sync(
            last_update_count,
            sync_state.last_sync_time(&scope),
            &remote_state,
        );
        let after_usn = if full_sync { 0 } else { last_update_count };
        info!(
            %scope,
            full_sync,
            after_usn,
            server_usn = remote_state.update_count,
            "Downloading scope"
        );

        let mut result = ScopeDownloadResult {
            full_sync,
            ..Default::default()
        };

        let chunks = if !full_sync && remote_state.update_count <= after_usn {
            debug!(%scope, "No new sync chunks");
            Vec::new()
        } else {
            let source = match linked_notebook {
                None => ChunkSource::UserOwn { full_sync },
                Some(linked_notebook) => ChunkSource::LinkedNotebook {
                    linked_notebook,
                    full_sync,
                },
            };
            let provider = SyncChunksProvider::new(
                Arc::clone(&note_store),
                Arc::clone(&self.ctx.chunks_storage),
                self.ctx.options.max_sync_chunk_entries,
                self.ctx.notifier.clone(),
                self.ctx.canceler.clone(),
            );
            provider.fetch(&source, after_usn, request_ctx).await?
        };

        let processor_ctx = self.ctx.processor_context(scope.clone());

        // Linked notebooks live in the user's own account only
        if scope == SyncScope::UserOwn {
            let status = DurableProcessor::<LinkedNotebook>::new(processor_ctx.clone())
                .process(&chunks)
                .await?;
            result.expunged_linked_notebooks = status.expunged_guids.clone();
            result.fold(&chunks, status);
        }
        if result.stop_synchronization_error.is_some() || self.ctx.is_cancelled() {
            return self.finish_scope(&scope, result, None);
        }

        let notebooks = DurableProcessor::<Notebook>::new(processor_ctx.clone());
        let tags = DurableProcessor::<Tag>::new(processor_ctx.clone());
        let searches = DurableProcessor::<SavedSearch>::new(processor_ctx.clone());
        // Every category runs to completion before an error is surfaced.
        let (notebooks, tags, searches) = tokio::join!(
            notebooks.process(&chunks),
            tags.process(&chunks),
            searches.process(&chunks),
        );
        result.fold(&chunks, notebooks?);
        result.fold(&chunks, tags?);
        result.fold(&chunks, searches?);
        self.ctx
            .notifier
            .sync_chunks_data_processed(&scope, result.sync_chunks_data_counters);
        if result.stop_synchronization_error.is_some() || self.ctx.is_cancelled() {
            return self.finish_scope(&scope, result, None);
        }

        result.download_notes_status = NotesProcessor::new(
            processor_ctx.clone(),
            Arc::clone(&note_store),
            request_ctx.clone(),
            &self.ctx.options,
        )
        .process(&chunks)
        .await?;
        let stop = result.download_notes_status.stop_synchronization_error;
        result.stop_synchronization_error.merge(&stop);
        if result.stop_synchronization_error.is_some() || self.ctx.is_cancelled() {
            return self.finish_scope(&scope, result, None);
        }

        result.download_resources_status = ResourcesProcessor::new(
            processor_ctx,
            Arc::clone(&note_store),
            request_ctx.clone(),
            &self.ctx.options,
        )
        .process(&chunks)
        .await?;
        let stop = result.download_resources_status.stop_synchronization_error;
        result.stop_synchronization_error.merge(&stop);
        if result.stop_synchronization_error.is_some() || self.ctx.is_cancelled() {
            return self.finish_scope(&scope, result, None);
        }

        if full_sync {
            let expunger = FullSyncStaleDataExpunger::new(
                Arc::clone(&self.ctx.local_store),
                self.ctx.canceler.clone(),
            );
            result.stale_data_expunge_status = expunger
                .expunge_stale_data(&scope, &ObservedGuids::from_chunks(&chunks))
                .await?;
        }

        let update_count = chunks
            .iter()
            .filter_map(|chunk| chunk.chunk_high_usn)
            .max()
            .unwrap_or(remote_state.update_count)
            .max(after_usn);
        if self.ctx.options.clear_sync_chunks_after_processing {
            if let Err(e) = self.ctx.chunks_storage.clear(&scope).await {
                warn!(%scope, error = %e, "Failed to clear sync chunks");
            }
        }

        self.finish_scope(&scope, result, Some((update_count, remote_state.current_time)))
    }

    fn finish_scope(
        &self,
        scope: &SyncScope,
        mut result: ScopeDownloadResult,
        watermark: Option<(Usn, Timestamp)>,
    ) -> Result<ScopeOutcome> {
        if self.ctx.is_cancelled() {
            info!(%scope, "Scope download cancelled");
            return Err(Error::Cancelled);
        }
        if let Some((update_count, _)) = watermark {
            result.update_count = update_count;
        }
        debug!(
            %scope,
            notes_new = result.download_notes_status.total_new,
            notes_updated = result.download_notes_status.total_updated,
            stopped = result.stop_synchronization_error.is_some(),
            "Scope download finished"
        );
        Ok(ScopeOutcome { result, watermark })
    }
}
