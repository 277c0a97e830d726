//! Unified test utilities for notesync integration tests
//!
//! The fakes keep everything in memory and record the remote calls they
//! receive, so that scenario tests can assert on both the final local state
//! and on the traffic the engine generated to get there.

use crate::concurrency_utils::ConcurrencyGauge;
use async_trait::async_trait;
use notesync_config::{init_logging, ConfigBuilder, LoggingConfig};
use notesync_sync::{SyncEvent, SyncOptions, SyncResult, Synchronizer};
use notesync_types::{
    Account, AccountLimits, AuthInfo, AuthMode, AuthenticationProvider, Error, Guid, Item,
    ItemKind, LinkedNotebook, ListFilter, LocalId, LocalStore, Note, NoteDataSpec, NoteStore,
    NoteStoreProvider, Notebook, RequestContext, Resource, Result, SavedSearch, ServiceLevel,
    SyncChunk, SyncChunkFilter, SyncItem, SyncScope, SyncState, Tag, Timestamp, User, UserStore,
    Usn,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Server time reported by the fake note stores
pub const SERVER_TIME: Timestamp = 1_700_000_000_000;

/// Bytes returned for thumbnails and ink note images
pub const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

static LOGGING: Once = Once::new();

/// Install a quiet subscriber once per test binary; `RUST_LOG` overrides it
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let config = LoggingConfig {
            level: "warn".to_string(),
            colored_output: false,
            ..Default::default()
        };
        let _ = init_logging(&config);
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Account used by every scenario
pub fn test_account() -> Account {
    Account {
        name: "tester".to_string(),
        id: 42,
        shard_id: "s1".to_string(),
        note_store_url: "https://notes.example.com/shard/s1/notestore".to_string(),
    }
}

/// Options built from the default configuration, persisting under `root`
pub fn test_options(root: &std::path::Path) -> SyncOptions {
    let config = ConfigBuilder::new().add_defaults().build_or_default();
    SyncOptions::from_config(&config).with_persistence_root(root)
}

/// Remote notebook
pub fn notebook(guid: &str, usn: Usn, name: &str) -> Notebook {
    Notebook {
        guid: Some(guid.to_string()),
        usn: Some(usn),
        name: name.to_string(),
        ..Default::default()
    }
}

/// Remote tag
pub fn tag(guid: &str, usn: Usn, name: &str) -> Tag {
    Tag {
        guid: Some(guid.to_string()),
        usn: Some(usn),
        name: name.to_string(),
        ..Default::default()
    }
}

/// Remote saved search
pub fn saved_search(guid: &str, usn: Usn, name: &str) -> SavedSearch {
    SavedSearch {
        guid: Some(guid.to_string()),
        usn: Some(usn),
        name: name.to_string(),
        query: format!("intitle:{}", name),
        ..Default::default()
    }
}

/// Note metadata as carried by sync chunks
pub fn note(guid: &str, usn: Usn, title: &str, notebook_guid: &str) -> Note {
    Note {
        guid: Some(guid.to_string()),
        usn: Some(usn),
        title: title.to_string(),
        notebook_guid: Some(notebook_guid.to_string()),
        ..Default::default()
    }
}

/// Resource metadata attached to a note
pub fn resource(guid: &str, usn: Usn, note_guid: &str, mime: &str) -> Resource {
    Resource {
        guid: Some(guid.to_string()),
        usn: Some(usn),
        note_guid: Some(note_guid.to_string()),
        mime: mime.to_string(),
        ..Default::default()
    }
}

/// Linked notebook record of the user's own account
pub fn linked_notebook(guid: &str, usn: Usn, share_name: &str) -> LinkedNotebook {
    LinkedNotebook {
        guid: Some(guid.to_string()),
        usn: Some(usn),
        share_name: share_name.to_string(),
        username: "owner".to_string(),
        shard_id: "s2".to_string(),
        note_store_url: "https://notes.example.com/shard/s2/notestore".to_string(),
        ..Default::default()
    }
}

/// Empty chunk ending at `high_usn`
pub fn chunk(high_usn: Usn) -> SyncChunk {
    SyncChunk {
        current_time: SERVER_TIME,
        chunk_high_usn: Some(high_usn),
        update_count: high_usn,
        ..Default::default()
    }
}

fn sync_fields(item: &Item) -> (bool, Option<&Guid>) {
    match item {
        Item::LinkedNotebook(item) => (item.locally_modified, None),
        Item::Notebook(item) => (item.locally_modified, item.linked_notebook_guid.as_ref()),
        Item::Tag(item) => (item.locally_modified, item.linked_notebook_guid.as_ref()),
        Item::SavedSearch(item) => (item.locally_modified, None),
        Item::Note(item) => (item.locally_modified, item.linked_notebook_guid.as_ref()),
        Item::Resource(item) => (item.locally_modified, item.linked_notebook_guid.as_ref()),
    }
}

fn matches_filter(item: &Item, filter: &ListFilter) -> bool {
    let (locally_modified, linked_notebook_guid) = sync_fields(item);
    if filter.locally_modified_only && !locally_modified && item.guid().is_some() {
        return false;
    }
    if let Some(scope) = &filter.scope {
        if SyncScope::from_linked_notebook_guid(linked_notebook_guid) != *scope {
            return false;
        }
    }
    if let Some(tag_guid) = &filter.tag_guid {
        return matches!(item, Item::Note(note) if note.tag_guids.contains(tag_guid));
    }
    true
}

/// Local store keeping items in a map keyed by local id
#[derive(Debug, Default)]
pub struct InMemoryLocalStore {
    items: Mutex<HashMap<LocalId, Item>>,
    puts: AtomicUsize,
}

impl InMemoryLocalStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an item
    pub fn insert<T: SyncItem>(&self, item: T) -> LocalId {
        let local_id = item.local_id();
        lock(&self.items).insert(local_id, item.into_item());
        local_id
    }

    /// Every item of one kind
    pub fn all<T: SyncItem>(&self) -> Vec<T> {
        lock(&self.items)
            .values()
            .filter(|item| item.kind() == T::KIND)
            .cloned()
            .filter_map(T::from_item)
            .collect()
    }

    /// Item of one kind with the given guid
    pub fn get<T: SyncItem>(&self, guid: &str) -> Option<T> {
        self.all::<T>()
            .into_iter()
            .find(|item| item.guid().map(String::as_str) == Some(guid))
    }

    /// Item of one kind with the given local id
    pub fn get_local<T: SyncItem>(&self, local_id: LocalId) -> Option<T> {
        lock(&self.items).get(&local_id).cloned().and_then(T::from_item)
    }

    /// Number of `put` calls received
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn of_kind(&self, kind: ItemKind) -> Vec<Item> {
        lock(&self.items)
            .values()
            .filter(|item| item.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn put(&self, item: Item) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        lock(&self.items).insert(item.local_id(), item);
        Ok(())
    }

    async fn find_by_guid(&self, kind: ItemKind, guid: &str) -> Result<Option<Item>> {
        Ok(self
            .of_kind(kind)
            .into_iter()
            .find(|item| item.guid().map(String::as_str) == Some(guid)))
    }

    async fn find_by_local_id(&self, kind: ItemKind, local_id: LocalId) -> Result<Option<Item>> {
        Ok(lock(&self.items)
            .get(&local_id)
            .filter(|item| item.kind() == kind)
            .cloned())
    }

    async fn find_by_name(
        &self,
        kind: ItemKind,
        name: &str,
        linked_notebook_guid: Option<&str>,
    ) -> Result<Option<Item>> {
        Ok(self.of_kind(kind).into_iter().find(|item| match item {
            Item::Notebook(notebook) => {
                notebook.name == name
                    && notebook.linked_notebook_guid.as_deref() == linked_notebook_guid
            }
            Item::Tag(tag) => {
                tag.name == name && tag.linked_notebook_guid.as_deref() == linked_notebook_guid
            }
            Item::SavedSearch(search) => search.name == name,
            _ => false,
        }))
    }

    async fn expunge_by_guid(&self, kind: ItemKind, guid: &str) -> Result<()> {
        let mut items = lock(&self.items);
        let before = items.len();
        items.retain(|_, item| item.kind() != kind || item.guid().map(String::as_str) != Some(guid));
        if items.len() == before {
            return Err(Error::not_found(format!("{} {}", kind, guid)));
        }
        Ok(())
    }

    async fn expunge_by_local_id(&self, kind: ItemKind, local_id: LocalId) -> Result<()> {
        let mut items = lock(&self.items);
        if !items.get(&local_id).is_some_and(|item| item.kind() == kind) {
            return Err(Error::not_found(format!("{} {}", kind, local_id)));
        }
        items.remove(&local_id);
        Ok(())
    }

    async fn list(&self, kind: ItemKind, filter: &ListFilter) -> Result<Vec<Item>> {
        Ok(self
            .of_kind(kind)
            .into_iter()
            .filter(|item| matches_filter(item, filter))
            .collect())
    }
}

/// Remote call recorded by [`FakeNoteStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    /// Sync state of the account or linked notebook
    SyncState,
    /// Sync chunk after the given USN
    SyncChunk {
        /// Requested starting point
        after_usn: Usn,
    },
    /// Full note
    GetNote(Guid),
    /// Full resource
    GetResource(Guid),
    /// Note thumbnail
    Thumbnail(Guid),
    /// Ink note image
    InkNoteImage(Guid),
    /// Single item fetched after a send conflict
    Fetch(ItemKind, Guid),
    /// Item creation, by name or title
    Create(ItemKind, String),
    /// Item update
    Update(ItemKind, Guid),
}

#[derive(Debug, Default)]
struct RemoteState {
    sync_state: SyncState,
    chunks: Vec<SyncChunk>,
    notes: HashMap<Guid, Note>,
    resources: HashMap<Guid, Resource>,
    notebooks: HashMap<Guid, Notebook>,
    tags: HashMap<Guid, Tag>,
    searches: HashMap<Guid, SavedSearch>,
    sync_state_failures: VecDeque<Error>,
    chunk_failures: HashMap<Usn, Error>,
    note_failures: HashMap<Guid, Error>,
    create_failures: HashMap<(ItemKind, String), Error>,
    update_conflicts: HashSet<Guid>,
    foreign_usns: Usn,
    created: u32,
}

impl RemoteState {
    fn next_usn(&mut self) -> Usn {
        self.sync_state.update_count += 1 + std::mem::take(&mut self.foreign_usns);
        self.sync_state.update_count
    }

    fn next_guid(&mut self, kind: ItemKind) -> Guid {
        self.created += 1;
        format!("{}-created-{}", kind, self.created)
    }

    fn chunk_after(&self, after_usn: Usn) -> SyncChunk {
        let mut chunk = self
            .chunks
            .iter()
            .find(|chunk| chunk.chunk_high_usn.is_some_and(|high| high > after_usn))
            .cloned()
            .unwrap_or_else(|| SyncChunk {
                current_time: self.sync_state.current_time,
                ..Default::default()
            });
        chunk.update_count = self.sync_state.update_count;
        chunk
    }
}

/// Scriptable in-memory remote note store
#[derive(Debug)]
pub struct FakeNoteStore {
    state: Mutex<RemoteState>,
    calls: Mutex<Vec<RemoteCall>>,
    note_downloads: ConcurrencyGauge,
    download_delay: Mutex<Duration>,
}

impl Default for FakeNoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNoteStore {
    /// Create a store with no data
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState {
                sync_state: SyncState {
                    current_time: SERVER_TIME,
                    full_sync_before: 0,
                    update_count: 0,
                },
                ..Default::default()
            }),
            calls: Mutex::new(Vec::new()),
            note_downloads: ConcurrencyGauge::new(),
            download_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Publish a chunk; its notes and resources become downloadable
    pub fn push_chunk(&self, chunk: SyncChunk) {
        let mut state = lock(&self.state);
        if let Some(high) = chunk.chunk_high_usn {
            state.sync_state.update_count = state.sync_state.update_count.max(high);
        }
        for note in &chunk.notes {
            if let Some(guid) = &note.guid {
                let mut full = note.clone();
                full.content = Some(format!("<en-note>{}</en-note>", note.title));
                for resource in &mut full.resources {
                    resource.data = Some(resource.mime.as_bytes().to_vec());
                }
                state.notes.insert(guid.clone(), full);
            }
        }
        for resource in &chunk.resources {
            if let Some(guid) = &resource.guid {
                let mut full = resource.clone();
                full.data = Some(resource.mime.as_bytes().to_vec());
                state.resources.insert(guid.clone(), full);
            }
        }
        for notebook in &chunk.notebooks {
            if let Some(guid) = &notebook.guid {
                state.notebooks.insert(guid.clone(), notebook.clone());
            }
        }
        for tag in &chunk.tags {
            if let Some(guid) = &tag.guid {
                state.tags.insert(guid.clone(), tag.clone());
            }
        }
        for search in &chunk.searches {
            if let Some(guid) = &search.guid {
                state.searches.insert(guid.clone(), search.clone());
            }
        }
        state.chunks.push(chunk);
    }

    /// Replace the full data served for a note
    pub fn put_note(&self, note: Note) {
        if let Some(guid) = note.guid.clone() {
            lock(&self.state).notes.insert(guid, note);
        }
    }

    /// Require clients that synced before `time` to run a full sync
    pub fn set_full_sync_before(&self, time: Timestamp) {
        lock(&self.state).sync_state.full_sync_before = time;
    }

    /// Let another client write `count` changes right before our next write
    pub fn interleave_foreign_changes(&self, count: Usn) {
        lock(&self.state).foreign_usns = count;
    }

    /// Fail the next sync state request
    pub fn fail_next_sync_state(&self, error: Error) {
        lock(&self.state).sync_state_failures.push_back(error);
    }

    /// Fail the next chunk request after `after_usn`
    pub fn fail_chunk_after(&self, after_usn: Usn, error: Error) {
        lock(&self.state).chunk_failures.insert(after_usn, error);
    }

    /// Fail every download of a note until cleared
    pub fn fail_note(&self, guid: &str, error: Error) {
        lock(&self.state).note_failures.insert(guid.to_string(), error);
    }

    /// Serve every note again
    pub fn clear_note_failures(&self) {
        lock(&self.state).note_failures.clear();
    }

    /// Fail the next creation of the item of `kind` with this name or title
    pub fn fail_create_of(&self, kind: ItemKind, name: &str, error: Error) {
        lock(&self.state)
            .create_failures
            .insert((kind, name.to_string()), error);
    }

    /// Reject updates of the item with a stale-USN conflict
    pub fn reject_updates_of(&self, guid: &str) {
        lock(&self.state).update_conflicts.insert(guid.to_string());
    }

    /// Delay every full note download
    pub fn set_download_delay(&self, delay: Duration) {
        *lock(&self.download_delay) = delay;
    }

    /// Highest USN of the store
    pub fn update_count(&self) -> Usn {
        lock(&self.state).sync_state.update_count
    }

    /// Full note as stored remotely
    pub fn remote_note(&self, guid: &str) -> Option<Note> {
        lock(&self.state).notes.get(guid).cloned()
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// `after_usn` of every chunk request, in order
    pub fn chunk_requests(&self) -> Vec<Usn> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::SyncChunk { after_usn } => Some(after_usn),
                _ => None,
            })
            .collect()
    }

    /// Number of full note downloads requested
    pub fn note_downloads(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, RemoteCall::GetNote(_)))
            .count()
    }

    /// Gauge wrapped around full note downloads
    pub fn note_download_gauge(&self) -> &ConcurrencyGauge {
        &self.note_downloads
    }

    fn record(&self, call: RemoteCall) {
        lock(&self.calls).push(call);
    }

    fn sync_state(&self) -> Result<SyncState> {
        self.record(RemoteCall::SyncState);
        let mut state = lock(&self.state);
        if let Some(error) = state.sync_state_failures.pop_front() {
            return Err(error);
        }
        Ok(state.sync_state)
    }

    fn sync_chunk(&self, after_usn: Usn) -> Result<SyncChunk> {
        self.record(RemoteCall::SyncChunk { after_usn });
        let mut state = lock(&self.state);
        if let Some(error) = state.chunk_failures.remove(&after_usn) {
            return Err(error);
        }
        Ok(state.chunk_after(after_usn))
    }

    fn created<T: SyncItem>(&self, item: &T, name: &str) -> Result<T> {
        self.record(RemoteCall::Create(T::KIND, name.to_string()));
        let mut state = lock(&self.state);
        if let Some(error) = state.create_failures.remove(&(T::KIND, name.to_string())) {
            return Err(error);
        }
        let guid = state.next_guid(T::KIND);
        let usn = state.next_usn();
        let mut created = item.clone();
        created.set_sync_identity(guid, usn);
        Ok(created)
    }

    fn updated<T: SyncItem>(&self, item: &T) -> Result<T> {
        let guid = item
            .guid()
            .cloned()
            .ok_or_else(|| Error::invalid_argument("update without guid"))?;
        self.record(RemoteCall::Update(T::KIND, guid.clone()));
        let mut state = lock(&self.state);
        if state.update_conflicts.contains(&guid) {
            return Err(Error::conflict(format!("{} {} has a newer USN", T::KIND, guid)));
        }
        let usn = state.next_usn();
        let mut updated = item.clone();
        updated.set_sync_identity(guid, usn);
        Ok(updated)
    }
}

#[async_trait]
impl NoteStore for FakeNoteStore {
    async fn get_sync_state(&self, _ctx: &RequestContext) -> Result<SyncState> {
        self.sync_state()
    }

    async fn get_linked_notebook_sync_state(
        &self,
        _linked_notebook: &LinkedNotebook,
        _ctx: &RequestContext,
    ) -> Result<SyncState> {
        self.sync_state()
    }

    async fn get_filtered_sync_chunk(
        &self,
        after_usn: Usn,
        _max_entries: u32,
        _filter: &SyncChunkFilter,
        _ctx: &RequestContext,
    ) -> Result<SyncChunk> {
        self.sync_chunk(after_usn)
    }

    async fn get_linked_notebook_sync_chunk(
        &self,
        _linked_notebook: &LinkedNotebook,
        after_usn: Usn,
        _max_entries: u32,
        _full_sync_only: bool,
        _ctx: &RequestContext,
    ) -> Result<SyncChunk> {
        self.sync_chunk(after_usn)
    }

    async fn get_note(
        &self,
        guid: &str,
        _spec: &NoteDataSpec,
        _ctx: &RequestContext,
    ) -> Result<Note> {
        self.record(RemoteCall::GetNote(guid.to_string()));
        if let Some(error) = lock(&self.state).note_failures.get(guid).cloned() {
            return Err(error);
        }

        let _in_flight = self.note_downloads.enter();
        let delay = *lock(&self.download_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.state)
            .notes
            .get(guid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("note {}", guid)))
    }

    async fn get_resource(
        &self,
        guid: &str,
        _spec: &NoteDataSpec,
        _ctx: &RequestContext,
    ) -> Result<Resource> {
        self.record(RemoteCall::GetResource(guid.to_string()));
        lock(&self.state)
            .resources
            .get(guid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("resource {}", guid)))
    }

    async fn get_notebook(&self, guid: &str, _ctx: &RequestContext) -> Result<Notebook> {
        self.record(RemoteCall::Fetch(ItemKind::Notebook, guid.to_string()));
        lock(&self.state)
            .notebooks
            .get(guid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("notebook {}", guid)))
    }

    async fn get_tag(&self, guid: &str, _ctx: &RequestContext) -> Result<Tag> {
        self.record(RemoteCall::Fetch(ItemKind::Tag, guid.to_string()));
        lock(&self.state)
            .tags
            .get(guid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("tag {}", guid)))
    }

    async fn get_saved_search(&self, guid: &str, _ctx: &RequestContext) -> Result<SavedSearch> {
        self.record(RemoteCall::Fetch(ItemKind::SavedSearch, guid.to_string()));
        lock(&self.state)
            .searches
            .get(guid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("saved search {}", guid)))
    }

    async fn get_note_thumbnail(&self, note_guid: &str, _ctx: &RequestContext) -> Result<Vec<u8>> {
        self.record(RemoteCall::Thumbnail(note_guid.to_string()));
        Ok(FAKE_PNG.to_vec())
    }

    async fn get_ink_note_image(
        &self,
        resource_guid: &str,
        _ctx: &RequestContext,
    ) -> Result<Vec<u8>> {
        self.record(RemoteCall::InkNoteImage(resource_guid.to_string()));
        Ok(FAKE_PNG.to_vec())
    }

    async fn create_note(&self, note: &Note, _ctx: &RequestContext) -> Result<Note> {
        let created = self.created(note, &note.title)?;
        self.put_note(created.clone());
        Ok(created)
    }

    async fn update_note(&self, note: &Note, _ctx: &RequestContext) -> Result<Note> {
        let updated = self.updated(note)?;
        self.put_note(updated.clone());
        Ok(updated)
    }

    async fn create_notebook(&self, notebook: &Notebook, _ctx: &RequestContext) -> Result<Notebook> {
        self.created(notebook, &notebook.name)
    }

    async fn update_notebook(&self, notebook: &Notebook, _ctx: &RequestContext) -> Result<Notebook> {
        self.updated(notebook)
    }

    async fn create_tag(&self, tag: &Tag, _ctx: &RequestContext) -> Result<Tag> {
        self.created(tag, &tag.name)
    }

    async fn update_tag(&self, tag: &Tag, _ctx: &RequestContext) -> Result<Tag> {
        self.updated(tag)
    }

    async fn create_saved_search(
        &self,
        search: &SavedSearch,
        _ctx: &RequestContext,
    ) -> Result<SavedSearch> {
        self.created(search, &search.name)
    }

    async fn update_saved_search(
        &self,
        search: &SavedSearch,
        _ctx: &RequestContext,
    ) -> Result<SavedSearch> {
        self.updated(search)
    }
}

/// Hands out the user's note store and the registered linked notebook stores
#[derive(Debug)]
pub struct FakeNoteStoreProvider {
    user_own: Arc<FakeNoteStore>,
    linked: Mutex<HashMap<Guid, Arc<FakeNoteStore>>>,
}

impl FakeNoteStoreProvider {
    /// Create a provider around the user's own store
    pub fn new(user_own: Arc<FakeNoteStore>) -> Self {
        Self {
            user_own,
            linked: Mutex::new(HashMap::new()),
        }
    }

    /// Register the store holding a linked notebook
    pub fn add_linked_notebook_store(&self, guid: &str, store: Arc<FakeNoteStore>) {
        lock(&self.linked).insert(guid.to_string(), store);
    }
}

impl NoteStoreProvider for FakeNoteStoreProvider {
    fn user_own_note_store(&self, _auth: &AuthInfo) -> Result<Arc<dyn NoteStore>> {
        Ok(Arc::clone(&self.user_own) as Arc<dyn NoteStore>)
    }

    fn linked_notebook_note_store(
        &self,
        linked_notebook: &LinkedNotebook,
        _auth: &AuthInfo,
    ) -> Result<Arc<dyn NoteStore>> {
        let guid = linked_notebook.guid.clone().unwrap_or_default();
        lock(&self.linked)
            .get(&guid)
            .map(|store| Arc::clone(store) as Arc<dyn NoteStore>)
            .ok_or_else(|| Error::network(format!("host of linked notebook {} unreachable", guid)))
    }
}

/// User store with a switchable protocol version check
#[derive(Debug)]
pub struct FakeUserStore {
    version_supported: AtomicBool,
    limits: AccountLimits,
}

impl Default for FakeUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeUserStore {
    /// Accept the client's protocol version
    pub fn new() -> Self {
        Self {
            version_supported: AtomicBool::new(true),
            limits: AccountLimits::default(),
        }
    }

    /// Use custom account limits
    pub fn with_limits(mut self, limits: AccountLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Accept or reject the client's protocol version
    pub fn set_version_supported(&self, supported: bool) {
        self.version_supported.store(supported, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserStore for FakeUserStore {
    async fn check_version(
        &self,
        _client_name: &str,
        _major: u16,
        _minor: u16,
        _ctx: &RequestContext,
    ) -> Result<bool> {
        Ok(self.version_supported.load(Ordering::SeqCst))
    }

    async fn get_user(&self, _ctx: &RequestContext) -> Result<User> {
        Ok(User {
            id: test_account().id,
            username: test_account().name,
            name: Some("Test User".to_string()),
            service_level: ServiceLevel::Plus,
        })
    }

    async fn get_account_limits(
        &self,
        _service_level: ServiceLevel,
        _ctx: &RequestContext,
    ) -> Result<AccountLimits> {
        Ok(self.limits)
    }
}

/// Authentication provider recording modes and cache clears
#[derive(Debug, Default)]
pub struct FakeAuthProvider {
    modes: Mutex<Vec<AuthMode>>,
    cleared_users: Mutex<Vec<i64>>,
    cleared_linked_notebooks: Mutex<Vec<Guid>>,
    cleared_all: AtomicUsize,
}

impl FakeAuthProvider {
    /// Create a provider that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Modes of the user's own authentications, in order
    pub fn modes(&self) -> Vec<AuthMode> {
        lock(&self.modes).clone()
    }

    /// Users whose cached credentials were dropped
    pub fn cleared_users(&self) -> Vec<i64> {
        lock(&self.cleared_users).clone()
    }

    /// Linked notebooks whose cached credentials were dropped
    pub fn cleared_linked_notebooks(&self) -> Vec<Guid> {
        lock(&self.cleared_linked_notebooks).clone()
    }

    /// Number of full cache clears
    pub fn cleared_all(&self) -> usize {
        self.cleared_all.load(Ordering::SeqCst)
    }

    fn auth_info(&self, token: String) -> AuthInfo {
        AuthInfo {
            user_id: test_account().id,
            auth_token: token,
            shard_id: test_account().shard_id,
            note_store_url: test_account().note_store_url,
            authentication_time: SERVER_TIME,
            auth_token_expiration_time: SERVER_TIME + 3_600_000,
        }
    }
}

#[async_trait]
impl AuthenticationProvider for FakeAuthProvider {
    async fn authenticate_account(&self, _account: &Account, mode: AuthMode) -> Result<AuthInfo> {
        let attempt = {
            let mut modes = lock(&self.modes);
            modes.push(mode);
            modes.len()
        };
        Ok(self.auth_info(format!("user-token-{}", attempt)))
    }

    async fn authenticate_to_linked_notebook(
        &self,
        _account: &Account,
        linked_notebook: &LinkedNotebook,
        _mode: AuthMode,
    ) -> Result<AuthInfo> {
        let guid = linked_notebook.guid.clone().unwrap_or_default();
        Ok(self.auth_info(format!("linked-token-{}", guid)))
    }

    fn clear_user_cache(&self, user_id: i64) {
        lock(&self.cleared_users).push(user_id);
    }

    fn clear_linked_notebook_cache(&self, linked_notebook_guid: &str) {
        lock(&self.cleared_linked_notebooks).push(linked_notebook_guid.to_string());
    }

    fn clear_all_caches(&self) {
        self.cleared_all.fetch_add(1, Ordering::SeqCst);
    }
}

/// Outcome of one harness run
#[derive(Debug)]
pub struct SyncRun {
    /// Value the sync future resolved to
    pub result: Result<SyncResult>,
    /// Events published during the run
    pub events: Vec<SyncEvent>,
}

impl SyncRun {
    /// The successful result; panics with the error otherwise
    pub fn ok(self) -> SyncResult {
        match self.result {
            Ok(result) => result,
            Err(e) => panic!("sync failed: {}", e),
        }
    }
}

/// Wires the fakes to a [`Synchronizer`] persisting into a temp directory
pub struct SyncHarness {
    /// Persistence root of the engine
    pub temp_dir: TempDir,
    /// Local store
    pub local_store: Arc<InMemoryLocalStore>,
    /// Remote store of the user's own account
    pub note_store: Arc<FakeNoteStore>,
    /// Note store provider
    pub provider: Arc<FakeNoteStoreProvider>,
    /// Authentication provider
    pub auth: Arc<FakeAuthProvider>,
    /// User store
    pub user_store: Arc<FakeUserStore>,
    /// Options passed to every run
    pub options: SyncOptions,
}

impl SyncHarness {
    /// Create a harness with empty local and remote data
    pub fn new() -> std::io::Result<Self> {
        init_test_logging();
        let temp_dir = TempDir::new()?;
        let options = test_options(&temp_dir.path().join("accounts"));
        let note_store = Arc::new(FakeNoteStore::new());
        Ok(Self {
            local_store: Arc::new(InMemoryLocalStore::new()),
            provider: Arc::new(FakeNoteStoreProvider::new(Arc::clone(&note_store))),
            note_store,
            auth: Arc::new(FakeAuthProvider::new()),
            user_store: Arc::new(FakeUserStore::new()),
            options,
            temp_dir,
        })
    }

    /// Register a remote store for a linked notebook and return it
    pub fn linked_notebook_store(&self, guid: &str) -> Arc<FakeNoteStore> {
        let store = Arc::new(FakeNoteStore::new());
        self.provider
            .add_linked_notebook_store(guid, Arc::clone(&store));
        store
    }

    /// Synchronizer talking to the fakes
    pub fn synchronizer(&self) -> Synchronizer {
        Synchronizer::new(
            Arc::clone(&self.auth) as Arc<dyn AuthenticationProvider>,
            Arc::clone(&self.provider) as Arc<dyn NoteStoreProvider>,
            Arc::clone(&self.user_store) as Arc<dyn UserStore>,
        )
    }

    /// Run one synchronization
    pub async fn sync(&self) -> SyncRun {
        self.sync_with(CancellationToken::new()).await
    }

    /// Run one synchronization observing the given token
    pub async fn sync_with(&self, canceler: CancellationToken) -> SyncRun {
        let (run, mut receiver) = self.synchronizer().synchronize_account(
            test_account(),
            Arc::clone(&self.local_store) as Arc<dyn LocalStore>,
            canceler,
            self.options.clone(),
            None,
        );
        let result = run.await;

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        SyncRun { result, events }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        test_options(std::path::Path::new("/tmp")).request_context("token")
    }

    #[tokio::test]
    async fn test_list_filter_selects_modified_and_scoped_items() {
        let store = InMemoryLocalStore::new();
        store.insert(notebook("nb1", 1, "Synced"));
        store.insert(Notebook {
            name: "New".to_string(),
            ..Default::default()
        });
        store.insert(Notebook {
            linked_notebook_guid: Some("ln1".to_string()),
            ..notebook("nb2", 2, "Shared")
        });

        let modified = store
            .list(ItemKind::Notebook, &ListFilter::locally_modified())
            .await
            .unwrap();
        assert_eq!(modified.len(), 1);

        let linked = store
            .list(
                ItemKind::Notebook,
                &ListFilter::in_scope(SyncScope::LinkedNotebook("ln1".to_string())),
            )
            .await
            .unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].guid().map(String::as_str), Some("nb2"));
    }

    #[tokio::test]
    async fn test_expunging_missing_item_reports_not_found() {
        let store = InMemoryLocalStore::new();
        let error = store
            .expunge_by_guid(ItemKind::Tag, "missing")
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fake_store_serves_chunks_in_order() {
        let store = FakeNoteStore::new();
        store.push_chunk(SyncChunk {
            notebooks: vec![notebook("nb1", 3, "Work")],
            ..chunk(3)
        });
        store.push_chunk(chunk(7));
        let filter = SyncChunkFilter::user_own(true);

        let first = store.get_filtered_sync_chunk(0, 10, &filter, &ctx()).await.unwrap();
        assert_eq!(first.chunk_high_usn, Some(3));
        assert_eq!(first.update_count, 7);

        let last = store.get_filtered_sync_chunk(7, 10, &filter, &ctx()).await.unwrap();
        assert_eq!(last.chunk_high_usn, None);
        assert_eq!(store.chunk_requests(), vec![0, 7]);
    }

    #[tokio::test]
    async fn test_fake_store_assigns_consecutive_usns() {
        let store = FakeNoteStore::new();
        store.push_chunk(chunk(10));

        let created = store
            .create_tag(
                &Tag {
                    name: "new".to_string(),
                    ..Default::default()
                },
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(created.usn, Some(11));
        assert!(created.guid.is_some());

        store.reject_updates_of("t1");
        let rejected = store.update_tag(&tag("t1", 5, "old"), &ctx()).await;
        assert!(matches!(rejected, Err(Error::Conflict { .. })));
    }
}
