//! Removal of local data the remote service no longer knows about

use crate::store;
use notesync_types::{
    Error, Guid, GuidFailure, ItemKind, ListFilter, LocalStore, Merge, Note, Notebook, Result,
    SavedSearch, SyncChunk, SyncItem, SyncScope, Tag,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Guids seen in the chunks of a full sync
#[derive(Debug, Clone, Default)]
pub struct ObservedGuids {
    notebooks: HashSet<Guid>,
    tags: HashSet<Guid>,
    saved_searches: HashSet<Guid>,
    notes: HashSet<Guid>,
}

impl ObservedGuids {
    /// Collect the guids of every updated item in `chunks`
    pub fn from_chunks(chunks: &[SyncChunk]) -> Self {
        let mut observed = Self::default();
        for chunk in chunks {
            observed.notebooks.extend(guids(&chunk.notebooks));
            observed.tags.extend(guids(&chunk.tags));
            observed.saved_searches.extend(guids(&chunk.searches));
            observed.notes.extend(guids(&chunk.notes));
        }
        observed
    }

    fn of_kind(&self, kind: ItemKind) -> Option<&HashSet<Guid>> {
        match kind {
            ItemKind::Notebook => Some(&self.notebooks),
            ItemKind::Tag => Some(&self.tags),
            ItemKind::SavedSearch => Some(&self.saved_searches),
            ItemKind::Note => Some(&self.notes),
            ItemKind::LinkedNotebook | ItemKind::Resource => None,
        }
    }
}

fn guids<T: SyncItem>(items: &[T]) -> impl Iterator<Item = Guid> + '_ {
    items.iter().filter_map(|item| item.guid().cloned())
}

/// Outcome of a stale data pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleDataExpungeStatus {
    /// Local items removed
    pub expunged: u64,
    /// Locally modified items that lost their guid and will be re-created
    pub detached: u64,
    /// Items that could not be removed or detached
    pub failures: Vec<GuidFailure>,
}

impl Merge for StaleDataExpungeStatus {
    fn merge(&mut self, other: &Self) {
        self.expunged += other.expunged;
        self.detached += other.detached;
        self.failures.extend(other.failures.iter().cloned());
    }
}

/// Removes local items a full sync did not observe.
///
/// Unmodified items are expunged; locally modified ones are detached from
/// their remote identity so that the sender creates them again.
pub struct FullSyncStaleDataExpunger {
    local_store: Arc<dyn LocalStore>,
    canceler: CancellationToken,
}

impl FullSyncStaleDataExpunger {
    /// Create an expunger
    pub fn new(local_store: Arc<dyn LocalStore>, canceler: CancellationToken) -> Self {
        Self {
            local_store,
            canceler,
        }
    }

    /// Expunge or detach stale items of one scope
    pub async fn expunge_stale_data(
        &self,
        scope: &SyncScope,
        observed: &ObservedGuids,
    ) -> Result<StaleDataExpungeStatus> {
        let mut status = StaleDataExpungeStatus::default();
        self.expunge_kind::<Note>(scope, observed, &mut status).await?;
        self.expunge_kind::<Tag>(scope, observed, &mut status).await?;
        self.expunge_kind::<Notebook>(scope, observed, &mut status).await?;
        // Saved searches only exist in the user's own account.
        if *scope == SyncScope::UserOwn {
            self.expunge_kind::<SavedSearch>(scope, observed, &mut status)
                .await?;
        }

        info!(
            %scope,
            expunged = status.expunged,
            detached = status.detached,
            failed = status.failures.len(),
            "Stale data pass finished"
        );
        Ok(status)
    }

    async fn expunge_kind<T: SyncItem>(
        &self,
        scope: &SyncScope,
        observed: &ObservedGuids,
        status: &mut StaleDataExpungeStatus,
    ) -> Result<()> {
        let Some(observed) = observed.of_kind(T::KIND) else {
            return Ok(());
        };
        let local_items =
            store::list::<T>(self.local_store.as_ref(), &ListFilter::in_scope(scope.clone()))
                .await?;

        for mut item in local_items {
            if self.canceler.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(guid) = item.guid().cloned() else {
                continue;
            };
            if observed.contains(&guid) {
                continue;
            }

            let outcome = if item.is_locally_modified() {
                debug!(kind = %T::KIND, %guid, "Detaching stale locally modified item");
                item.clear_sync_identity();
                item.set_locally_modified(true);
                store::put(self.local_store.as_ref(), item)
                    .await
                    .map(|()| status.detached += 1)
            } else {
                debug!(kind = %T::KIND, %guid, "Expunging stale item");
                match self
                    .local_store
                    .expunge_by_local_id(T::KIND, item.local_id())
                    .await
                {
                    Ok(()) | Err(Error::NotFound { .. }) => {
                        status.expunged += 1;
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            };

            if let Err(error) = outcome {
                if error.stop_synchronization_error().is_some() {
                    return Err(error);
                }
                warn!(kind = %T::KIND, %guid, error = %error, "Failed to remove stale item");
                status.failures.push(GuidFailure {
                    kind: T::KIND,
                    guid,
                    error,
                });
            }
        }
        Ok(())
    }

    /// Expunge every local item of a linked notebook that is gone
    pub async fn expunge_scope(&self, scope: &SyncScope) -> Result<StaleDataExpungeStatus> {
        self.expunge_stale_data(scope, &ObservedGuids::default())
            .await
    }

    /// Expunge linked notebook tags no local note refers to
    pub async fn expunge_unused_linked_notebook_tags(&self) -> Result<StaleDataExpungeStatus> {
        let mut status = StaleDataExpungeStatus::default();
        let local_store = self.local_store.as_ref();

        let tags = store::list::<Tag>(local_store, &ListFilter::default()).await?;
        for tag in tags {
            if self.canceler.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(guid) = tag.guid.clone() else {
                continue;
            };
            if tag.linked_notebook_guid.is_none() || tag.locally_modified {
                continue;
            }

            let filter = ListFilter {
                tag_guid: Some(guid.clone()),
                ..Default::default()
            };
            let referenced = !local_store.list(ItemKind::Note, &filter).await?.is_empty();
            if referenced {
                continue;
            }

            match local_store
                .expunge_by_local_id(ItemKind::Tag, tag.local_id)
                .await
            {
                Ok(()) | Err(Error::NotFound { .. }) => status.expunged += 1,
                Err(error) => {
                    warn!(%guid, error = %error, "Failed to expunge unused linked notebook tag");
                    status.failures.push(GuidFailure {
                        kind: ItemKind::Tag,
                        guid,
                        error,
                    });
                }
            }
        }

        if status.expunged > 0 {
            info!(expunged = status.expunged, "Expunged unused linked notebook tags");
        }
        Ok(status)
    }
}
