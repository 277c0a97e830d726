//! Notes: resolved against metadata, downloaded in full only when needed

use super::resources::store_ink_note_image;
use super::{ItemOutcome, ProcessorContext, PROCESSING_CONCURRENCY};
use crate::bounded::{note_downloader, NoteFullDataDownloader};
use crate::conflict::{ConflictResolution, ResolvableItem};
use crate::options::SyncOptions;
use crate::store::{self, Applied};
use notesync_types::{
    DownloadNotesStatus, LocalId, Note, NoteStore, Notebook, RequestContext, Result, SyncChunk,
    SyncItem, Tag, INK_NOTE_MIME_TYPE,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Applies the notes carried by sync chunks
pub struct NotesProcessor {
    ctx: ProcessorContext,
    note_store: Arc<dyn NoteStore>,
    request_ctx: RequestContext,
    downloader: NoteFullDataDownloader,
    concurrency: usize,
    download_thumbnails: bool,
    ink_note_images_dir: Option<PathBuf>,
    handled: AtomicU64,
}

impl NotesProcessor {
    /// Create a processor downloading from `note_store`
    pub fn new(
        ctx: ProcessorContext,
        note_store: Arc<dyn NoteStore>,
        request_ctx: RequestContext,
        options: &SyncOptions,
    ) -> Self {
        let downloader = note_downloader(
            Arc::clone(&note_store),
            request_ctx.clone(),
            options.max_concurrent_note_downloads,
            ctx.canceler.clone(),
        );
        Self {
            ctx,
            note_store,
            request_ctx,
            downloader,
            concurrency: options
                .max_concurrent_note_downloads
                .get()
                .max(PROCESSING_CONCURRENCY),
            download_thumbnails: options.download_note_thumbnails,
            ink_note_images_dir: options.ink_note_images_storage_dir.clone(),
            handled: AtomicU64::new(0),
        }
    }

    /// Apply the notes carried by `chunks`
    pub async fn process(&self, chunks: &[SyncChunk]) -> Result<DownloadNotesStatus> {
        let incoming = self.ctx.collect_incoming::<Note>(chunks).await?;
        let total = incoming.updates.len() as u64;
        self.ctx.notifier.notes_scheduled(total).await;

        self.ctx
            .run_items(incoming, self.concurrency, |theirs| {
                self.process_one(theirs, total)
            })
            .await
    }

    async fn process_one(&self, theirs: Note, total: u64) -> Result<ItemOutcome<Note>> {
        let outcome = self.handle(theirs).await?;
        let handled = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
        self.ctx
            .notifier
            .note_downloaded(&self.ctx.scope, handled, total)
            .await;
        Ok(outcome)
    }

    async fn handle(&self, theirs: Note) -> Result<ItemOutcome<Note>> {
        let local_store = self.ctx.local_store.as_ref();
        let Some(guid) = theirs.guid.clone() else {
            return Ok(ItemOutcome::skipped(&theirs));
        };

        let mine = match store::find_by_guid::<Note>(local_store, &guid).await {
            Ok(mine) => mine,
            Err(error) => return Ok(ItemOutcome::from_error(theirs, error, false)),
        };

        let resolution = match &mine {
            Some(mine) => Some(Note::resolve(self.ctx.resolver.as_ref(), &theirs, mine).await?),
            None => None,
        };
        if matches!(resolution, Some(ConflictResolution::UseMine)) {
            return Ok(ItemOutcome::applied(&theirs, Applied::Unchanged));
        }

        let full = match self.downloader.download_full(guid.clone()).await {
            Ok(full) => full,
            Err(error) => return Ok(ItemOutcome::from_error(theirs, error, true)),
        };
        if self.ctx.is_cancelled() {
            debug!(%guid, "Discarding note downloaded after cancellation");
            return Ok(ItemOutcome::skipped(&theirs));
        }

        let target_local_id = match (&mine, &resolution) {
            (Some(mine), Some(ConflictResolution::UseTheirs | ConflictResolution::MoveMine(_))) => {
                mine.local_id
            }
            _ => LocalId::new(),
        };
        let full = self.prepare(full, target_local_id, mine.as_ref()).await;

        let applied = match (mine, resolution) {
            (Some(mine), Some(resolution)) => {
                store::apply_resolution(local_store, full, &mine, resolution).await
            }
            _ => store::add(local_store, full).await,
        };

        Ok(match applied {
            Ok(applied) => ItemOutcome::applied(&theirs, applied),
            Err(error) => ItemOutcome::from_error(theirs, error, false),
        })
    }

    /// Attach local ids, thumbnail and ink images to a downloaded note
    async fn prepare(&self, mut note: Note, local_id: LocalId, mine: Option<&Note>) -> Note {
        let local_store = self.ctx.local_store.as_ref();
        note.local_id = local_id;
        note.set_linked_notebook_guid(self.ctx.scope.linked_notebook_guid().cloned());

        if let Some(notebook_guid) = note.notebook_guid.clone() {
            match store::find_by_guid::<Notebook>(local_store, &notebook_guid).await {
                Ok(Some(notebook)) => note.notebook_local_id = Some(notebook.local_id),
                Ok(None) => {}
                Err(e) => warn!(%notebook_guid, error = %e, "Failed to look up note's notebook"),
            }
        }

        let mut tag_local_ids = Vec::with_capacity(note.tag_guids.len());
        for tag_guid in &note.tag_guids {
            if let Ok(Some(tag)) = store::find_by_guid::<Tag>(local_store, tag_guid).await {
                tag_local_ids.push(tag.local_id);
            }
        }
        note.tag_local_ids = tag_local_ids;

        for resource in &mut note.resources {
            let existing = mine.and_then(|mine| {
                mine.resources
                    .iter()
                    .find(|r| r.guid.is_some() && r.guid == resource.guid)
            });
            if let Some(existing) = existing {
                resource.local_id = existing.local_id;
            }
            resource.note_guid = note.guid.clone();
            resource.note_local_id = Some(local_id);
            resource.locally_modified = false;
        }

        if self.download_thumbnails {
            if let Some(guid) = note.guid.as_deref() {
                match self.note_store.get_note_thumbnail(guid, &self.request_ctx).await {
                    Ok(thumbnail) => note.thumbnail = Some(thumbnail),
                    Err(e) => warn!(note = %guid, error = %e, "Failed to download note thumbnail"),
                }
            }
        }

        if let Some(dir) = &self.ink_note_images_dir {
            for resource in note
                .resources
                .iter()
                .filter(|resource| resource.mime == INK_NOTE_MIME_TYPE)
            {
                if let Some(resource_guid) = resource.guid.as_deref() {
                    store_ink_note_image(
                        self.note_store.as_ref(),
                        &self.request_ctx,
                        dir,
                        resource_guid,
                    )
                    .await;
                }
            }
        }

        note
    }
}
