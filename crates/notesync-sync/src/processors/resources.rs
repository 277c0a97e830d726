//! Standalone resources of incremental syncs

use super::{ItemOutcome, ProcessorContext, PROCESSING_CONCURRENCY};
use crate::bounded::{resource_downloader, ResourceFullDataDownloader};
use crate::options::SyncOptions;
use crate::store::{self, Applied};
use notesync_types::{
    DownloadResourcesStatus, Note, NoteStore, RequestContext, Resource, Result, SyncChunk,
    SyncItem, INK_NOTE_MIME_TYPE,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// Applies resources that changed without their note
pub struct ResourcesProcessor {
    ctx: ProcessorContext,
    note_store: Arc<dyn NoteStore>,
    request_ctx: RequestContext,
    downloader: ResourceFullDataDownloader,
    concurrency: usize,
    ink_note_images_dir: Option<PathBuf>,
    handled: AtomicU64,
}

impl ResourcesProcessor {
    /// Create a processor downloading from `note_store`
    pub fn new(
        ctx: ProcessorContext,
        note_store: Arc<dyn NoteStore>,
        request_ctx: RequestContext,
        options: &SyncOptions,
    ) -> Self {
        let downloader = resource_downloader(
            Arc::clone(&note_store),
            request_ctx.clone(),
            options.max_concurrent_resource_downloads,
            ctx.canceler.clone(),
        );
        Self {
            ctx,
            note_store,
            request_ctx,
            downloader,
            concurrency: options
                .max_concurrent_resource_downloads
                .get()
                .max(PROCESSING_CONCURRENCY),
            ink_note_images_dir: options.ink_note_images_storage_dir.clone(),
            handled: AtomicU64::new(0),
        }
    }

    /// Apply the resources carried by `chunks`
    pub async fn process(&self, chunks: &[SyncChunk]) -> Result<DownloadResourcesStatus> {
        let incoming = self.ctx.collect_incoming::<Resource>(chunks).await?;
        let total = incoming.updates.len() as u64;
        self.ctx.notifier.resources_scheduled(total).await;

        self.ctx
            .run_items(incoming, self.concurrency, |theirs| {
                self.process_one(theirs, total)
            })
            .await
    }

    async fn process_one(&self, theirs: Resource, total: u64) -> Result<ItemOutcome<Resource>> {
        let outcome = self.handle(theirs).await;
        let handled = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
        self.ctx
            .notifier
            .resource_downloaded(&self.ctx.scope, handled, total)
            .await;
        Ok(outcome)
    }

    async fn handle(&self, theirs: Resource) -> ItemOutcome<Resource> {
        let local_store = self.ctx.local_store.as_ref();
        let Some(guid) = theirs.guid.clone() else {
            return ItemOutcome::skipped(&theirs);
        };

        let mine = match store::find_by_guid::<Resource>(local_store, &guid).await {
            Ok(mine) => mine,
            Err(error) => return ItemOutcome::from_error(theirs, error, false),
        };
        // Already current, typically because its note was downloaded in full.
        if let Some(mine) = &mine {
            if matches!((mine.usn, theirs.usn), (Some(my_usn), Some(their_usn)) if my_usn >= their_usn)
            {
                return ItemOutcome::applied(&theirs, Applied::Unchanged);
            }
        }

        let mut full = match self.downloader.download_full(guid.clone()).await {
            Ok(full) => full,
            Err(error) => return ItemOutcome::from_error(theirs, error, true),
        };
        if self.ctx.is_cancelled() {
            debug!(%guid, "Discarding resource downloaded after cancellation");
            return ItemOutcome::skipped(&theirs);
        }

        full.local_id = mine.as_ref().map_or(theirs.local_id, |mine| mine.local_id);
        full.note_guid = full.note_guid.or_else(|| theirs.note_guid.clone());
        full.set_linked_notebook_guid(self.ctx.scope.linked_notebook_guid().cloned());
        if let Some(note_guid) = full.note_guid.as_deref() {
            if let Ok(Some(note)) = store::find_by_guid::<Note>(local_store, note_guid).await {
                full.note_local_id = Some(note.local_id);
            }
        }

        if let Some(dir) = &self.ink_note_images_dir {
            if full.mime == INK_NOTE_MIME_TYPE {
                store_ink_note_image(self.note_store.as_ref(), &self.request_ctx, dir, &guid).await;
            }
        }

        let applied = if mine.is_some() {
            Applied::Updated
        } else {
            Applied::Added
        };
        full.locally_modified = false;
        match store::put(local_store, full).await {
            Ok(()) => ItemOutcome::applied(&theirs, applied),
            Err(error) => ItemOutcome::from_error(theirs, error, false),
        }
    }
}

/// Download the rendered image of an ink note resource into `dir`.
///
/// Failures are logged and otherwise ignored.
pub(crate) async fn store_ink_note_image(
    note_store: &dyn NoteStore,
    ctx: &RequestContext,
    dir: &Path,
    resource_guid: &str,
) {
    let image = match note_store.get_ink_note_image(resource_guid, ctx).await {
        Ok(image) => image,
        Err(e) => {
            warn!(resource = %resource_guid, error = %e, "Failed to download ink note image");
            return;
        }
    };

    let path = dir.join(format!("{}.png", resource_guid));
    let written = async {
        fs::create_dir_all(dir).await?;
        fs::write(&path, image).await
    };
    if let Err(e) = written.await {
        warn!(path = %path.display(), error = %e, "Failed to store ink note image");
    }
}
