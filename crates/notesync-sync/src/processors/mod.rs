//! Durable processing of the items carried by sync chunks
//!
//! Each category of a scope goes through the same lifecycle: the items a set
//! of chunks carries are merged with whatever the pending journal still holds
//! from an interrupted run, journaled, then applied to the local store
//! concurrently. Expunges win over updates of the same guid. A stop error
//! from any item halts new work and leaves the rest journaled.

mod notes;
mod resources;

pub use notes::NotesProcessor;
pub use resources::ResourcesProcessor;

use crate::conflict::{ConflictResolver, ResolvableItem};
use crate::pending::{PendingEntry, PendingState, PendingStateStore};
use crate::progress::SyncEventsNotifier;
use crate::store::{self, Applied};
use futures::stream::{self, StreamExt};
use notesync_types::{
    DownloadItemsStatus, Error, Guid, GuidFailure, ItemFailure, LocalStore, Merge, Result,
    StopSynchronizationError, SyncChunk, SyncItem, SyncScope, Usn,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local store writes issued concurrently within one category
pub(crate) const PROCESSING_CONCURRENCY: usize = 32;

/// Collaborators shared by the processors of one scope
#[derive(Clone)]
pub struct ProcessorContext {
    /// Local item store
    pub local_store: Arc<dyn LocalStore>,
    /// Conflict resolver
    pub resolver: Arc<dyn ConflictResolver>,
    /// Pending-item journals
    pub pending: Arc<dyn PendingStateStore>,
    /// Progress events
    pub notifier: SyncEventsNotifier,
    /// Caller's cancellation token
    pub canceler: CancellationToken,
    /// Scope being processed
    pub scope: SyncScope,
}

/// Items of one category left to handle in this run
#[derive(Debug)]
pub(crate) struct IncomingItems<T> {
    pub(crate) updates: BTreeMap<Guid, T>,
    pub(crate) expunges: BTreeSet<Guid>,
    pub(crate) retry_counts: HashMap<Guid, u32>,
}

impl<T> IncomingItems<T> {
    pub(crate) fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.expunges.is_empty()
    }
}

/// What happened to one updated item
#[derive(Debug)]
pub(crate) enum ItemOutcome<T> {
    Applied { guid: Guid, usn: Usn, applied: Applied },
    FailedToDownload(ItemFailure<T>),
    FailedToProcess(ItemFailure<T>),
    Skipped { guid: Guid, usn: Usn },
    Stopped { item: T, error: StopSynchronizationError },
}

impl<T: SyncItem> ItemOutcome<T> {
    pub(crate) fn applied(item: &T, applied: Applied) -> Self {
        Self::Applied {
            guid: item.guid().cloned().unwrap_or_default(),
            usn: item.usn().unwrap_or_default(),
            applied,
        }
    }

    pub(crate) fn skipped(item: &T) -> Self {
        Self::Skipped {
            guid: item.guid().cloned().unwrap_or_default(),
            usn: item.usn().unwrap_or_default(),
        }
    }

    /// Classify an error raised while handling `item`
    pub(crate) fn from_error(item: T, error: Error, during_download: bool) -> Self {
        if let Some(stop) = error.stop_synchronization_error() {
            return Self::Stopped { item, error: stop };
        }
        match error {
            Error::Cancelled => Self::skipped(&item),
            error if during_download => Self::FailedToDownload(ItemFailure::new(item, error)),
            error => Self::FailedToProcess(ItemFailure::new(item, error)),
        }
    }
}

#[derive(Debug)]
enum ExpungeOutcome {
    Expunged(Guid),
    Failed(GuidFailure),
    Skipped(Guid),
    Stopped(Guid, StopSynchronizationError),
}

impl ProcessorContext {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.canceler.is_cancelled()
    }

    /// Merge chunk-carried items with the journal and journal the result
    pub(crate) async fn collect_incoming<T: SyncItem>(
        &self,
        chunks: &[SyncChunk],
    ) -> Result<IncomingItems<T>> {
        let mut updates: BTreeMap<Guid, T> = BTreeMap::new();
        let mut expunges = BTreeSet::new();
        let mut retry_counts = HashMap::new();
        let linked_notebook_guid = self.scope.linked_notebook_guid().cloned();

        let persisted = self.pending.load(&self.scope, T::KIND).await?;
        for (guid, entry) in &persisted {
            retry_counts.insert(guid.clone(), entry.retry_count);
            match entry.state {
                PendingState::PendingExpunge => {
                    expunges.insert(guid.clone());
                }
                PendingState::PendingDownload | PendingState::PendingProcess => {
                    let Some(value) = entry.item.clone() else {
                        continue;
                    };
                    match serde_json::from_value::<T>(value) {
                        Ok(item) => {
                            updates.insert(guid.clone(), item);
                        }
                        Err(e) => {
                            warn!(scope = %self.scope, kind = %T::KIND, %guid, error = %e, "Dropping unreadable pending item");
                        }
                    }
                }
            }
        }
        let resumed = updates.len() + expunges.len();

        for chunk in chunks {
            for item in T::from_chunk(chunk) {
                let Some(guid) = item.guid().cloned() else {
                    warn!(scope = %self.scope, kind = %T::KIND, "Ignoring remote item without guid");
                    continue;
                };
                let newer = updates
                    .get(&guid)
                    .map_or(true, |existing| existing.usn() <= item.usn());
                if newer {
                    let mut item = item.clone();
                    item.set_linked_notebook_guid(linked_notebook_guid.clone());
                    updates.insert(guid, item);
                }
            }
            expunges.extend(T::expunged_in_chunk(chunk).iter().cloned());
        }

        updates.retain(|guid, _| !expunges.contains(guid));

        for guid in &expunges {
            if !matches!(persisted.get(guid), Some(entry) if entry.state == PendingState::PendingExpunge)
            {
                self.pending
                    .upsert(&self.scope, T::KIND, guid, &PendingEntry::expunge())
                    .await?;
            }
        }
        for (guid, item) in &updates {
            let unchanged = persisted
                .get(guid)
                .is_some_and(|entry| entry.state != PendingState::PendingExpunge && entry.usn == item.usn());
            if !unchanged {
                let entry = PendingEntry::item(
                    PendingState::PendingProcess,
                    item.usn(),
                    serde_json::to_value(item)?,
                );
                self.pending.upsert(&self.scope, T::KIND, guid, &entry).await?;
            }
        }

        if resumed > 0 {
            info!(scope = %self.scope, kind = %T::KIND, resumed, "Resuming pending items");
        }
        Ok(IncomingItems {
            updates,
            expunges,
            retry_counts,
        })
    }

    async fn record_failure<T: SyncItem>(
        &self,
        item: &T,
        state: PendingState,
        retry_counts: &HashMap<Guid, u32>,
    ) {
        let Some(guid) = item.guid() else {
            return;
        };
        let entry = match serde_json::to_value(item) {
            Ok(value) => PendingEntry {
                state,
                usn: item.usn(),
                retry_count: retry_counts.get(guid).copied().unwrap_or(0) + 1,
                item: Some(value),
            },
            Err(e) => {
                warn!(kind = %T::KIND, %guid, error = %e, "Failed to serialize pending item");
                return;
            }
        };
        if let Err(e) = self.pending.upsert(&self.scope, T::KIND, guid, &entry).await {
            warn!(kind = %T::KIND, %guid, error = %e, "Failed to journal item failure");
        }
    }

    async fn record_done<T: SyncItem>(&self, guid: &str) {
        if let Err(e) = self.pending.remove(&self.scope, T::KIND, guid).await {
            warn!(kind = %T::KIND, %guid, error = %e, "Failed to journal processed item");
        }
    }

    async fn expunge_one<T: SyncItem>(&self, guid: Guid, stop: &CancellationToken) -> ExpungeOutcome {
        if self.is_cancelled() || stop.is_cancelled() {
            return ExpungeOutcome::Skipped(guid);
        }

        match self.local_store.expunge_by_guid(T::KIND, &guid).await {
            Ok(()) | Err(Error::NotFound { .. }) => {
                self.record_done::<T>(&guid).await;
                ExpungeOutcome::Expunged(guid)
            }
            Err(error) => match error.stop_synchronization_error() {
                Some(stop_error) => ExpungeOutcome::Stopped(guid, stop_error),
                None if matches!(error, Error::Cancelled) => ExpungeOutcome::Skipped(guid),
                None => ExpungeOutcome::Failed(GuidFailure {
                    kind: T::KIND,
                    guid,
                    error,
                }),
            },
        }
    }

    /// Apply incoming items with `handler`, at most `concurrency` at a time,
    /// keeping the journal current.
    ///
    /// Expunges are applied before updates. A resolver contract violation
    /// stops new work and fails the category once in-flight items settle;
    /// their outcomes are journaled first.
    pub(crate) async fn run_items<T, F, Fut>(
        &self,
        incoming: IncomingItems<T>,
        concurrency: usize,
        handler: F,
    ) -> Result<DownloadItemsStatus<T>>
    where
        T: SyncItem,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<ItemOutcome<T>>>,
    {
        let mut status = DownloadItemsStatus::new();
        if incoming.is_empty() {
            self.clear_journal::<T>().await;
            return Ok(status);
        }

        let stop = CancellationToken::new();
        let stop = &stop;
        let retry_counts = &incoming.retry_counts;

        let expunge_outcomes: Vec<ExpungeOutcome> = stream::iter(incoming.expunges)
            .map(|guid| self.expunge_one::<T>(guid, stop))
            .buffer_unordered(PROCESSING_CONCURRENCY)
            .inspect(|outcome| {
                if matches!(outcome, ExpungeOutcome::Stopped(..)) {
                    stop.cancel();
                }
            })
            .collect()
            .await;

        for outcome in expunge_outcomes {
            match outcome {
                ExpungeOutcome::Expunged(guid) => {
                    status.total_expunged += 1;
                    status.expunged_guids.insert(guid);
                }
                ExpungeOutcome::Failed(failure) => status.guids_failed_to_expunge.push(failure),
                ExpungeOutcome::Skipped(guid) => {
                    status.cancelled_guids_and_usns.insert(guid, 0);
                }
                ExpungeOutcome::Stopped(guid, error) => {
                    status.cancelled_guids_and_usns.insert(guid, 0);
                    status.stop_synchronization_error.merge(&Some(error));
                }
            }
        }

        let handler = &handler;
        let updates = stream::iter(incoming.updates.into_values());
        let item_outcomes: Vec<Result<ItemOutcome<T>>> = updates
            .map(|item| async move {
                if self.is_cancelled() || stop.is_cancelled() {
                    return Ok(ItemOutcome::skipped(&item));
                }
                let outcome = match handler(item).await {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        stop.cancel();
                        return Err(error);
                    }
                };
                match &outcome {
                    ItemOutcome::Applied { guid, .. } => self.record_done::<T>(guid).await,
                    ItemOutcome::FailedToDownload(failure) => {
                        self.record_failure(&failure.item, PendingState::PendingDownload, retry_counts)
                            .await;
                    }
                    ItemOutcome::FailedToProcess(failure) => {
                        self.record_failure(&failure.item, PendingState::PendingProcess, retry_counts)
                            .await;
                    }
                    ItemOutcome::Stopped { .. } => stop.cancel(),
                    ItemOutcome::Skipped { .. } => {}
                }
                Ok::<_, Error>(outcome)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut abort = None;
        for outcome in item_outcomes {
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(error) => {
                    abort.get_or_insert(error);
                    continue;
                }
            };
            match outcome {
                ItemOutcome::Applied {
                    guid,
                    usn,
                    applied,
                } => {
                    match applied {
                        Applied::Added => status.total_new += 1,
                        Applied::Updated => status.total_updated += 1,
                        Applied::Unchanged => {}
                    }
                    status.processed_guids_and_usns.insert(guid, usn);
                }
                ItemOutcome::FailedToDownload(failure) => status.failed_to_download.push(failure),
                ItemOutcome::FailedToProcess(failure) => status.failed_to_process.push(failure),
                ItemOutcome::Skipped { guid, usn } => {
                    status.cancelled_guids_and_usns.insert(guid, usn);
                }
                ItemOutcome::Stopped { item, error } => {
                    if let Some(guid) = item.guid() {
                        status
                            .cancelled_guids_and_usns
                            .insert(guid.clone(), item.usn().unwrap_or_default());
                    }
                    status.stop_synchronization_error.merge(&Some(error));
                }
            }
        }

        if let Some(error) = abort {
            warn!(
                scope = %self.scope,
                kind = %T::KIND,
                processed = status.processed_guids_and_usns.len(),
                error = %error,
                "Category aborted"
            );
            return Err(error);
        }

        if status.is_clean() && status.cancelled_guids_and_usns.is_empty() {
            self.clear_journal::<T>().await;
        }

        debug!(
            scope = %self.scope,
            kind = %T::KIND,
            new = status.total_new,
            updated = status.total_updated,
            expunged = status.total_expunged,
            failed = status.failed_to_process.len() + status.failed_to_download.len(),
            "Category processed"
        );
        Ok(status)
    }

    async fn clear_journal<T: SyncItem>(&self) {
        if let Err(e) = self.pending.clear(&self.scope, T::KIND).await {
            warn!(scope = %self.scope, kind = %T::KIND, error = %e, "Failed to clear pending journal");
        }
    }
}

/// Processor for the categories fully carried by sync chunks: linked
/// notebooks, notebooks, tags and saved searches
pub struct DurableProcessor<T> {
    ctx: ProcessorContext,
    _kind: PhantomData<fn() -> T>,
}

impl<T: SyncItem + ResolvableItem> DurableProcessor<T> {
    /// Create a processor
    pub fn new(ctx: ProcessorContext) -> Self {
        Self {
            ctx,
            _kind: PhantomData,
        }
    }

    /// Apply the items of this category carried by `chunks`
    pub async fn process(&self, chunks: &[SyncChunk]) -> Result<DownloadItemsStatus<T>> {
        let incoming = self.ctx.collect_incoming::<T>(chunks).await?;
        let in_batch: BTreeSet<Guid> = incoming
            .updates
            .keys()
            .chain(&incoming.expunges)
            .cloned()
            .collect();
        let in_batch = &in_batch;
        self.ctx
            .run_items(incoming, PROCESSING_CONCURRENCY, |theirs| {
                self.process_one(theirs, in_batch)
            })
            .await
    }

    async fn process_one(&self, theirs: T, in_batch: &BTreeSet<Guid>) -> Result<ItemOutcome<T>> {
        let local_store = self.ctx.local_store.as_ref();

        let mine = match store::find_conflicting(local_store, &theirs).await {
            Ok(mine) => mine,
            Err(error) => return Ok(ItemOutcome::from_error(theirs, error, false)),
        };

        // A name held by another remote item that this batch also updates or
        // expunges is being given up remotely; that item is handled by its own guid.
        let mine = mine.filter(|mine| {
            mine.guid()
                .map_or(true, |guid| theirs.guid() == Some(guid) || !in_batch.contains(guid))
        });

        let applied = match mine {
            None => store::add(local_store, theirs.clone()).await,
            Some(mine) => {
                // Contract violations abort the whole category.
                let resolution = T::resolve(self.ctx.resolver.as_ref(), &theirs, &mine).await?;
                store::apply_resolution(local_store, theirs.clone(), &mine, resolution).await
            }
        };

        Ok(match applied {
            Ok(applied) => ItemOutcome::applied(&theirs, applied),
            Err(error) => ItemOutcome::from_error(theirs, error, false),
        })
    }
}
