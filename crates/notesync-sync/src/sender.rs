//! Upload of local changes
//!
//! Items are sent one at a time so that every returned USN can be checked
//! against the scope's watermark: an unbroken sequence means no other client
//! touched the account meanwhile and the watermark may follow. Tags go
//! first, parents before children, then saved searches, notebooks and
//! finally notes, whose notebook and tag references are rewritten to the
//! guids assigned just before.

use crate::conflict::ResolvableItem;
use crate::context::SyncContext;
use crate::progress::SyncPhase;
use crate::store;
use crate::sync_state::LastSyncState;
use async_trait::async_trait;
use notesync_types::{
    AccountLimits, AuthInfo, AuthMode, Error, ItemFailure, LinkedNotebook, ListFilter, LocalId,
    Note, NoteDataSpec, NoteStore, Notebook, RequestContext, Result, SavedSearch, SendStatus,
    SyncScope, Tag, Usn,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Remote operations and status bookkeeping of one sendable kind
#[async_trait]
pub(crate) trait SendableItem: ResolvableItem {
    async fn create(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self>;
    async fn update(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self>;
    async fn fetch(note_store: &dyn NoteStore, guid: &str, ctx: &RequestContext) -> Result<Self>;

    fn record_attempt(status: &mut SendStatus);
    fn record_success(status: &mut SendStatus);
    fn record_failure(status: &mut SendStatus, failure: ItemFailure<Self>);
}

#[async_trait]
impl SendableItem for Tag {
    async fn create(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self> {
        note_store.create_tag(item, ctx).await
    }

    async fn update(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self> {
        note_store.update_tag(item, ctx).await
    }

    async fn fetch(note_store: &dyn NoteStore, guid: &str, ctx: &RequestContext) -> Result<Self> {
        note_store.get_tag(guid, ctx).await
    }

    fn record_attempt(status: &mut SendStatus) {
        status.total_attempted_to_send_tags += 1;
    }

    fn record_success(status: &mut SendStatus) {
        status.total_successfully_sent_tags += 1;
    }

    fn record_failure(status: &mut SendStatus, failure: ItemFailure<Self>) {
        status.failed_to_send_tags.push(failure);
    }
}

#[async_trait]
impl SendableItem for SavedSearch {
    async fn create(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self> {
        note_store.create_saved_search(item, ctx).await
    }

    async fn update(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self> {
        note_store.update_saved_search(item, ctx).await
    }

    async fn fetch(note_store: &dyn NoteStore, guid: &str, ctx: &RequestContext) -> Result<Self> {
        note_store.get_saved_search(guid, ctx).await
    }

    fn record_attempt(status: &mut SendStatus) {
        status.total_attempted_to_send_saved_searches += 1;
    }

    fn record_success(status: &mut SendStatus) {
        status.total_successfully_sent_saved_searches += 1;
    }

    fn record_failure(status: &mut SendStatus, failure: ItemFailure<Self>) {
        status.failed_to_send_saved_searches.push(failure);
    }
}

#[async_trait]
impl SendableItem for Notebook {
    async fn create(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self> {
        note_store.create_notebook(item, ctx).await
    }

    async fn update(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self> {
        note_store.update_notebook(item, ctx).await
    }

    async fn fetch(note_store: &dyn NoteStore, guid: &str, ctx: &RequestContext) -> Result<Self> {
        note_store.get_notebook(guid, ctx).await
    }

    fn record_attempt(status: &mut SendStatus) {
        status.total_attempted_to_send_notebooks += 1;
    }

    fn record_success(status: &mut SendStatus) {
        status.total_successfully_sent_notebooks += 1;
    }

    fn record_failure(status: &mut SendStatus, failure: ItemFailure<Self>) {
        status.failed_to_send_notebooks.push(failure);
    }
}

#[async_trait]
impl SendableItem for Note {
    async fn create(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self> {
        note_store.create_note(item, ctx).await
    }

    async fn update(note_store: &dyn NoteStore, item: &Self, ctx: &RequestContext) -> Result<Self> {
        note_store.update_note(item, ctx).await
    }

    async fn fetch(note_store: &dyn NoteStore, guid: &str, ctx: &RequestContext) -> Result<Self> {
        note_store.get_note(guid, &NoteDataSpec::full(), ctx).await
    }

    fn record_attempt(status: &mut SendStatus) {
        status.total_attempted_to_send_notes += 1;
    }

    fn record_success(status: &mut SendStatus) {
        status.total_successfully_sent_notes += 1;
    }

    fn record_failure(status: &mut SendStatus, failure: ItemFailure<Self>) {
        status.failed_to_send_notes.push(failure);
    }
}

/// USNs returned for one scope during a send pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UsnTracker {
    last: Usn,
    contiguous: bool,
}

impl UsnTracker {
    pub(crate) fn new(last: Usn) -> Self {
        Self {
            last,
            contiguous: true,
        }
    }

    /// Record a USN assigned by the remote service
    pub(crate) fn observe(&mut self, usn: Usn) {
        if usn != self.last + 1 {
            self.contiguous = false;
        }
        self.last = self.last.max(usn);
    }

    pub(crate) fn last(&self) -> Usn {
        self.last
    }

    pub(crate) fn is_contiguous(&self) -> bool {
        self.contiguous
    }
}

/// Order tags so that every parent precedes its children
pub(crate) fn parents_first(tags: Vec<Tag>) -> Vec<Tag> {
    let pending: HashSet<LocalId> = tags.iter().map(|tag| tag.local_id).collect();
    let mut emitted = HashSet::new();
    let mut ordered = Vec::with_capacity(tags.len());
    let mut remaining = tags;

    while !remaining.is_empty() {
        let (ready, rest): (Vec<Tag>, Vec<Tag>) = remaining.into_iter().partition(|tag| {
            tag.parent_local_id
                .map_or(true, |parent| !pending.contains(&parent) || emitted.contains(&parent))
        });
        if ready.is_empty() {
            warn!(tags = rest.len(), "Tag parent cycle, sending remaining tags unordered");
            ordered.extend(rest);
            break;
        }
        emitted.extend(ready.iter().map(|tag| tag.local_id));
        ordered.extend(ready);
        remaining = rest;
    }
    ordered
}

enum Sent {
    Continue,
    Stop,
}

/// State of one send pass
struct SendPass<'a> {
    auth: &'a AuthInfo,
    limits: &'a AccountLimits,
    status: SendStatus,
    trackers: HashMap<SyncScope, UsnTracker>,
    note_stores: HashMap<SyncScope, (Arc<dyn NoteStore>, RequestContext)>,
    sync_state: LastSyncState,
}

/// Sends locally modified items to the remote service
pub struct Sender {
    ctx: SyncContext,
}

impl Sender {
    /// Create a sender
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Send every locally modified item
    pub async fn send(&self, auth: &AuthInfo, limits: &AccountLimits) -> Result<SendStatus> {
        self.ctx.notifier.set_phase(SyncPhase::Sending).await;
        let mut pass = SendPass {
            auth,
            limits,
            status: SendStatus::new(),
            trackers: HashMap::new(),
            note_stores: HashMap::new(),
            sync_state: self.ctx.sync_state_storage.load().await?,
        };

        let completed = self.send_all(&mut pass).await;
        self.advance_watermarks(&mut pass).await?;
        completed?;

        info!(
            notes = pass.status.total_successfully_sent_notes,
            notebooks = pass.status.total_successfully_sent_notebooks,
            tags = pass.status.total_successfully_sent_tags,
            saved_searches = pass.status.total_successfully_sent_saved_searches,
            repeat = pass.status.need_to_repeat_incremental_sync,
            "Send finished"
        );
        Ok(pass.status)
    }

    async fn send_all(&self, pass: &mut SendPass<'_>) -> Result<()> {
        let local_store = self.ctx.local_store.as_ref();
        let modified = ListFilter::locally_modified();

        let tags = parents_first(store::list::<Tag>(local_store, &modified).await?);
        for tag in tags {
            // Re-read: the parent may have received its guid in this pass.
            let tag = self.with_parent_guid(tag).await?;
            if let Sent::Stop = self.send_one(pass, tag).await? {
                return Ok(());
            }
        }

        for search in store::list::<SavedSearch>(local_store, &modified).await? {
            if let Sent::Stop = self.send_one(pass, search).await? {
                return Ok(());
            }
        }

        for notebook in store::list::<Notebook>(local_store, &modified).await? {
            if let Sent::Stop = self.send_one(pass, notebook).await? {
                return Ok(());
            }
        }

        for mut note in store::list::<Note>(local_store, &modified).await? {
            if let Some(error) = self.resolve_references(&mut note).await? {
                Note::record_attempt(&mut pass.status);
                self.record_failure(pass, note, error).await;
                continue;
            }
            if note.content_size() as i64 > pass.limits.note_size_max {
                Note::record_attempt(&mut pass.status);
                let error = Error::invalid_argument(format!(
                    "note content of {} bytes exceeds the account limit of {} bytes",
                    note.content_size(),
                    pass.limits.note_size_max
                ));
                self.record_failure(pass, note, error).await;
                continue;
            }
            if let Sent::Stop = self.send_one(pass, note).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn with_parent_guid(&self, mut tag: Tag) -> Result<Tag> {
        if let Some(parent_local_id) = tag.parent_local_id {
            let parent =
                store::find_by_local_id::<Tag>(self.ctx.local_store.as_ref(), parent_local_id)
                    .await?;
            if let Some(parent_guid) = parent.and_then(|parent| parent.guid) {
                tag.parent_guid = Some(parent_guid);
            }
        }
        Ok(tag)
    }

    /// Rewrite the notebook and tag references of `note` to guids.
    ///
    /// Returns the reason the note cannot be sent when a referenced item
    /// exists locally but has no guid yet, e.g. because its own send failed.
    async fn resolve_references(&self, note: &mut Note) -> Result<Option<Error>> {
        let local_store = self.ctx.local_store.as_ref();
        if let Some(notebook_local_id) = note.notebook_local_id {
            match store::find_by_local_id::<Notebook>(local_store, notebook_local_id).await? {
                Some(Notebook { guid: Some(guid), .. }) => note.notebook_guid = Some(guid),
                Some(notebook) => {
                    return Ok(Some(Error::sync(format!(
                        "notebook {} of the note has not been sent",
                        notebook.local_id
                    ))));
                }
                None => {}
            }
        }

        if !note.tag_local_ids.is_empty() {
            let mut tag_guids = Vec::with_capacity(note.tag_local_ids.len());
            for tag_local_id in &note.tag_local_ids {
                match store::find_by_local_id::<Tag>(local_store, *tag_local_id).await? {
                    Some(Tag { guid: Some(guid), .. }) => tag_guids.push(guid),
                    Some(tag) => {
                        return Ok(Some(Error::sync(format!(
                            "tag {} of the note has not been sent",
                            tag.local_id
                        ))));
                    }
                    None => {}
                }
            }
            note.tag_guids = tag_guids;
        }
        Ok(None)
    }

    async fn send_one<T: SendableItem>(&self, pass: &mut SendPass<'_>, item: T) -> Result<Sent> {
        if self.ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        T::record_attempt(&mut pass.status);
        let scope = item.scope();

        let (note_store, request_ctx) = match self.note_store_for(pass, &scope).await {
            Ok(note_store) => note_store,
            Err(error) => return Ok(self.handle_error(pass, item, error).await),
        };

        let sent = if item.guid().is_some() {
            T::update(note_store.as_ref(), &item, &request_ctx).await
        } else {
            T::create(note_store.as_ref(), &item, &request_ctx).await
        };

        let sent = match sent {
            Ok(sent) => sent,
            Err(Error::Conflict { message }) => {
                debug!(kind = %T::KIND, local_id = %item.local_id(), %message, "Remote rejected stale item");
                pass.status.need_to_repeat_incremental_sync = true;
                self.resolve_send_conflict(note_store.as_ref(), &request_ctx, &item)
                    .await?;
                self.record_failure(pass, item, Error::Conflict { message })
                    .await;
                return Ok(Sent::Continue);
            }
            Err(error) => return Ok(self.handle_error(pass, item, error).await),
        };

        let (Some(guid), Some(usn)) = (sent.guid().cloned(), sent.usn()) else {
            let error = Error::remote("remote service returned an item without guid or USN");
            self.record_failure(pass, item, error).await;
            return Ok(Sent::Continue);
        };

        let local_id = item.local_id();
        let mut local = item;
        local.set_sync_identity(guid.clone(), usn);
        local.set_locally_modified(false);
        if let Err(error) = store::put(self.ctx.local_store.as_ref(), local.clone()).await {
            warn!(kind = %T::KIND, %guid, error = %error, "Sent item could not be written back");
            pass.status.need_to_repeat_incremental_sync = true;
            return Ok(self.handle_error(pass, local, error).await);
        }

        let last = pass.sync_state.update_count(&scope);
        pass.trackers
            .entry(scope)
            .or_insert_with(|| UsnTracker::new(last))
            .observe(usn);
        T::record_success(&mut pass.status);
        self.ctx.notifier.item_sent(T::KIND, local_id, guid).await;
        Ok(Sent::Continue)
    }

    async fn handle_error<T: SendableItem>(&self, pass: &mut SendPass<'_>, item: T, error: Error) -> Sent {
        match error.stop_synchronization_error() {
            Some(stop) => {
                warn!(kind = %T::KIND, ?stop, "Send stopped");
                pass.status.stop_synchronization_error = Some(stop);
                pass.status.need_to_repeat_incremental_sync = true;
                self.ctx.notifier.stopped(stop);
                self.record_failure(pass, item, error).await;
                Sent::Stop
            }
            None => {
                self.record_failure(pass, item, error).await;
                Sent::Continue
            }
        }
    }

    async fn record_failure<T: SendableItem>(&self, pass: &mut SendPass<'_>, item: T, error: Error) {
        warn!(kind = %T::KIND, local_id = %item.local_id(), error = %error, "Failed to send item");
        self.ctx
            .notifier
            .item_failed_to_send(T::KIND, item.local_id(), error.clone())
            .await;
        T::record_failure(&mut pass.status, ItemFailure::new(item, error));
    }

    /// Resolve an item the remote service rejected as stale
    async fn resolve_send_conflict<T: SendableItem>(
        &self,
        note_store: &dyn NoteStore,
        request_ctx: &RequestContext,
        mine: &T,
    ) -> Result<()> {
        let Some(guid) = mine.guid() else {
            return Ok(());
        };
        let mut theirs = match T::fetch(note_store, guid, request_ctx).await {
            Ok(theirs) => theirs,
            Err(e) => {
                warn!(kind = %T::KIND, %guid, error = %e, "Failed to fetch conflicting remote item");
                return Ok(());
            }
        };
        theirs.set_linked_notebook_guid(mine.linked_notebook_guid().cloned());

        let resolution = T::resolve(self.ctx.resolver.as_ref(), &theirs, mine).await?;
        debug!(kind = %T::KIND, %guid, resolution = ?resolution.kind(), "Resolved send conflict");
        if let Err(e) =
            store::apply_resolution(self.ctx.local_store.as_ref(), theirs, mine, resolution).await
        {
            warn!(kind = %T::KIND, %guid, error = %e, "Failed to apply send conflict resolution");
        }
        Ok(())
    }

    async fn note_store_for(
        &self,
        pass: &mut SendPass<'_>,
        scope: &SyncScope,
    ) -> Result<(Arc<dyn NoteStore>, RequestContext)> {
        if let Some((note_store, request_ctx)) = pass.note_stores.get(scope) {
            return Ok((Arc::clone(note_store), request_ctx.clone()));
        }

        let (note_store, auth_token) = match scope {
            SyncScope::UserOwn => (
                self.ctx.note_store_provider.user_own_note_store(pass.auth)?,
                pass.auth.auth_token.clone(),
            ),
            SyncScope::LinkedNotebook(guid) => {
                let linked_notebook =
                    store::find_by_guid::<LinkedNotebook>(self.ctx.local_store.as_ref(), guid)
                        .await?
                        .ok_or_else(|| Error::not_found(format!("linked notebook {}", guid)))?;
                let auth = self
                    .ctx
                    .auth_provider
                    .authenticate_to_linked_notebook(&self.ctx.account, &linked_notebook, AuthMode::Cache)
                    .await?;
                (
                    self.ctx
                        .note_store_provider
                        .linked_notebook_note_store(&linked_notebook, &auth)?,
                    auth.auth_token,
                )
            }
        };

        let request_ctx = self.ctx.options.request_context(&auth_token);
        pass.note_stores
            .insert(scope.clone(), (Arc::clone(&note_store), request_ctx.clone()));
        Ok((note_store, request_ctx))
    }

    async fn advance_watermarks(&self, pass: &mut SendPass<'_>) -> Result<()> {
        let mut changed = false;
        for (scope, tracker) in &pass.trackers {
            if tracker.is_contiguous() {
                let sync_time = pass.sync_state.last_sync_time(scope);
                pass.sync_state.set(scope, tracker.last(), sync_time);
                changed = true;
            } else {
                info!(%scope, "Account changed concurrently, another download is needed");
                pass.status.need_to_repeat_incremental_sync = true;
            }
        }
        if changed {
            self.ctx.sync_state_storage.save(&pass.sync_state).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str, local_id: LocalId, parent: Option<LocalId>) -> Tag {
        Tag {
            local_id,
            name: name.to_string(),
            parent_local_id: parent,
            locally_modified: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_parents_are_sent_first() {
        let root = LocalId::new();
        let child = LocalId::new();
        let grandchild = LocalId::new();
        let ordered = parents_first(vec![
            tag("grandchild", grandchild, Some(child)),
            tag("child", child, Some(root)),
            tag("root", root, None),
        ]);

        let names: Vec<_> = ordered.iter().map(|tag| tag.name.as_str()).collect();
        assert_eq!(names, vec!["root", "child", "grandchild"]);
    }

    #[test]
    fn test_parent_cycle_keeps_every_tag() {
        let a = LocalId::new();
        let b = LocalId::new();
        let ordered = parents_first(vec![tag("a", a, Some(b)), tag("b", b, Some(a))]);
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn test_usn_tracker() {
        let mut tracker = UsnTracker::new(10);
        tracker.observe(11);
        tracker.observe(12);
        assert!(tracker.is_contiguous());
        assert_eq!(tracker.last(), 12);

        tracker.observe(15);
        assert!(!tracker.is_contiguous());
        assert_eq!(tracker.last(), 15);
    }
}
