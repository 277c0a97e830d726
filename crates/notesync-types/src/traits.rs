//! Core traits for notesync
//!
//! This module defines the generic [`SyncItem`] accessor trait and the narrow
//! interfaces through which the engine talks to its external collaborators:
//! the local store, the remote note and user stores, and the authentication
//! provider.

use crate::types::{
    Account, AccountLimits, AuthInfo, AuthMode, Guid, Item, ItemKind, LinkedNotebook, LocalId,
    Note, NoteDataSpec, Notebook, RequestContext, Resource, SavedSearch, ServiceLevel, SyncChunk,
    SyncChunkFilter, SyncScope, SyncState, Tag, User, Usn,
};
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;

/// Generic access to the synchronization identity of an item
pub trait SyncItem: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Kind of the item
    const KIND: ItemKind;

    /// Local id
    fn local_id(&self) -> LocalId;
    /// Replace the local id
    fn set_local_id(&mut self, local_id: LocalId);
    /// Remote guid
    fn guid(&self) -> Option<&Guid>;
    /// Update sequence number
    fn usn(&self) -> Option<Usn>;
    /// Natural key used to match items without a common guid
    fn name(&self) -> Option<&str>;
    /// Replace the natural key
    fn set_name(&mut self, name: String);
    /// Linked notebook scope of the item
    fn linked_notebook_guid(&self) -> Option<&Guid>;
    /// Move the item to another linked notebook scope
    fn set_linked_notebook_guid(&mut self, guid: Option<Guid>);
    /// Whether the item has unsent local changes
    fn is_locally_modified(&self) -> bool;
    /// Mark or unmark unsent local changes
    fn set_locally_modified(&mut self, locally_modified: bool);
    /// Assign the identity returned by the remote service
    fn set_sync_identity(&mut self, guid: Guid, usn: Usn);
    /// Drop guid and USN together
    fn clear_sync_identity(&mut self);
    /// Wrap into [`Item`]
    fn into_item(self) -> Item;
    /// Unwrap from [`Item`] if the kind matches
    fn from_item(item: Item) -> Option<Self>;
    /// New or updated items of this kind in a chunk
    fn from_chunk(chunk: &SyncChunk) -> &[Self];
    /// Guids of expunged items of this kind in a chunk
    fn expunged_in_chunk(chunk: &SyncChunk) -> &[Guid];

    /// Scope the item belongs to
    fn scope(&self) -> SyncScope {
        SyncScope::from_linked_notebook_guid(self.linked_notebook_guid())
    }
}

macro_rules! sync_identity_accessors {
    () => {
        fn local_id(&self) -> LocalId {
            self.local_id
        }

        fn set_local_id(&mut self, local_id: LocalId) {
            self.local_id = local_id;
        }

        fn guid(&self) -> Option<&Guid> {
            self.guid.as_ref()
        }

        fn usn(&self) -> Option<Usn> {
            self.usn
        }

        fn is_locally_modified(&self) -> bool {
            self.locally_modified
        }

        fn set_locally_modified(&mut self, locally_modified: bool) {
            self.locally_modified = locally_modified;
        }

        fn set_sync_identity(&mut self, guid: Guid, usn: Usn) {
            self.guid = Some(guid);
            self.usn = Some(usn);
        }

        fn clear_sync_identity(&mut self) {
            self.guid = None;
            self.usn = None;
        }
    };
}

macro_rules! item_conversions {
    ($variant:ident, $items:ident) => {
        fn into_item(self) -> Item {
            Item::$variant(self)
        }

        fn from_item(item: Item) -> Option<Self> {
            match item {
                Item::$variant(item) => Some(item),
                _ => None,
            }
        }

        fn from_chunk(chunk: &SyncChunk) -> &[Self] {
            &chunk.$items
        }
    };
}

impl SyncItem for Notebook {
    const KIND: ItemKind = ItemKind::Notebook;

    sync_identity_accessors!();
    item_conversions!(Notebook, notebooks);

    fn expunged_in_chunk(chunk: &SyncChunk) -> &[Guid] {
        &chunk.expunged_notebooks
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn linked_notebook_guid(&self) -> Option<&Guid> {
        self.linked_notebook_guid.as_ref()
    }

    fn set_linked_notebook_guid(&mut self, guid: Option<Guid>) {
        self.linked_notebook_guid = guid;
    }
}

impl SyncItem for Tag {
    const KIND: ItemKind = ItemKind::Tag;

    sync_identity_accessors!();
    item_conversions!(Tag, tags);

    fn expunged_in_chunk(chunk: &SyncChunk) -> &[Guid] {
        &chunk.expunged_tags
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn linked_notebook_guid(&self) -> Option<&Guid> {
        self.linked_notebook_guid.as_ref()
    }

    fn set_linked_notebook_guid(&mut self, guid: Option<Guid>) {
        self.linked_notebook_guid = guid;
    }
}

impl SyncItem for SavedSearch {
    const KIND: ItemKind = ItemKind::SavedSearch;

    sync_identity_accessors!();
    item_conversions!(SavedSearch, searches);

    fn expunged_in_chunk(chunk: &SyncChunk) -> &[Guid] {
        &chunk.expunged_searches
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn linked_notebook_guid(&self) -> Option<&Guid> {
        None
    }

    fn set_linked_notebook_guid(&mut self, _guid: Option<Guid>) {}
}

impl SyncItem for Note {
    const KIND: ItemKind = ItemKind::Note;

    sync_identity_accessors!();
    item_conversions!(Note, notes);

    fn expunged_in_chunk(chunk: &SyncChunk) -> &[Guid] {
        &chunk.expunged_notes
    }

    // Notes are only ever matched by guid.
    fn name(&self) -> Option<&str> {
        None
    }

    fn set_name(&mut self, name: String) {
        self.title = name;
    }

    fn linked_notebook_guid(&self) -> Option<&Guid> {
        self.linked_notebook_guid.as_ref()
    }

    fn set_linked_notebook_guid(&mut self, guid: Option<Guid>) {
        for resource in &mut self.resources {
            resource.linked_notebook_guid = guid.clone();
        }
        self.linked_notebook_guid = guid;
    }
}

impl SyncItem for Resource {
    const KIND: ItemKind = ItemKind::Resource;

    sync_identity_accessors!();
    item_conversions!(Resource, resources);

    // Resources are expunged together with their notes.
    fn expunged_in_chunk(_chunk: &SyncChunk) -> &[Guid] {
        &[]
    }

    fn name(&self) -> Option<&str> {
        None
    }

    fn set_name(&mut self, _name: String) {}

    fn linked_notebook_guid(&self) -> Option<&Guid> {
        self.linked_notebook_guid.as_ref()
    }

    fn set_linked_notebook_guid(&mut self, guid: Option<Guid>) {
        self.linked_notebook_guid = guid;
    }
}

impl SyncItem for LinkedNotebook {
    const KIND: ItemKind = ItemKind::LinkedNotebook;

    sync_identity_accessors!();
    item_conversions!(LinkedNotebook, linked_notebooks);

    fn expunged_in_chunk(chunk: &SyncChunk) -> &[Guid] {
        &chunk.expunged_linked_notebooks
    }

    fn name(&self) -> Option<&str> {
        None
    }

    fn set_name(&mut self, name: String) {
        self.share_name = name;
    }

    fn linked_notebook_guid(&self) -> Option<&Guid> {
        None
    }

    fn set_linked_notebook_guid(&mut self, _guid: Option<Guid>) {}
}

/// Filter applied when listing items of the local store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only items with unsent local changes or without a guid
    pub locally_modified_only: bool,
    /// Only items of this scope; `None` lists every scope
    pub scope: Option<SyncScope>,
    /// Only notes carrying this tag
    pub tag_guid: Option<Guid>,
}

impl ListFilter {
    /// Items the sender has to upload
    pub fn locally_modified() -> Self {
        Self {
            locally_modified_only: true,
            ..Default::default()
        }
    }

    /// Every item of one scope
    pub fn in_scope(scope: SyncScope) -> Self {
        Self {
            scope: Some(scope),
            ..Default::default()
        }
    }
}

/// Local item store.
///
/// Every call commits independently; the engine never assumes cross-item
/// transactionality.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert or replace the item with the same local id
    async fn put(&self, item: Item) -> Result<()>;

    /// Find an item by guid
    async fn find_by_guid(&self, kind: ItemKind, guid: &str) -> Result<Option<Item>>;

    /// Find an item by local id
    async fn find_by_local_id(&self, kind: ItemKind, local_id: LocalId) -> Result<Option<Item>>;

    /// Find an item by natural key within a linked notebook scope
    async fn find_by_name(
        &self,
        kind: ItemKind,
        name: &str,
        linked_notebook_guid: Option<&str>,
    ) -> Result<Option<Item>>;

    /// Remove an item by guid
    async fn expunge_by_guid(&self, kind: ItemKind, guid: &str) -> Result<()>;

    /// Remove an item by local id
    async fn expunge_by_local_id(&self, kind: ItemKind, local_id: LocalId) -> Result<()>;

    /// List items matching the filter
    async fn list(&self, kind: ItemKind, filter: &ListFilter) -> Result<Vec<Item>>;
}

/// Remote note store of one account or linked notebook
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Synchronization state of the user's own account
    async fn get_sync_state(&self, ctx: &RequestContext) -> Result<SyncState>;

    /// Synchronization state of a linked notebook
    async fn get_linked_notebook_sync_state(
        &self,
        linked_notebook: &LinkedNotebook,
        ctx: &RequestContext,
    ) -> Result<SyncState>;

    /// Changes of the user's own account after `after_usn`
    async fn get_filtered_sync_chunk(
        &self,
        after_usn: Usn,
        max_entries: u32,
        filter: &SyncChunkFilter,
        ctx: &RequestContext,
    ) -> Result<SyncChunk>;

    /// Changes of a linked notebook after `after_usn`
    async fn get_linked_notebook_sync_chunk(
        &self,
        linked_notebook: &LinkedNotebook,
        after_usn: Usn,
        max_entries: u32,
        full_sync_only: bool,
        ctx: &RequestContext,
    ) -> Result<SyncChunk>;

    /// Full note
    async fn get_note(&self, guid: &str, spec: &NoteDataSpec, ctx: &RequestContext)
        -> Result<Note>;

    /// Full resource
    async fn get_resource(
        &self,
        guid: &str,
        spec: &NoteDataSpec,
        ctx: &RequestContext,
    ) -> Result<Resource>;

    /// Notebook
    async fn get_notebook(&self, guid: &str, ctx: &RequestContext) -> Result<Notebook>;

    /// Tag
    async fn get_tag(&self, guid: &str, ctx: &RequestContext) -> Result<Tag>;

    /// Saved search
    async fn get_saved_search(&self, guid: &str, ctx: &RequestContext) -> Result<SavedSearch>;

    /// PNG thumbnail of a note
    async fn get_note_thumbnail(&self, note_guid: &str, ctx: &RequestContext) -> Result<Vec<u8>>;

    /// Rendered PNG image of an ink note resource
    async fn get_ink_note_image(
        &self,
        resource_guid: &str,
        ctx: &RequestContext,
    ) -> Result<Vec<u8>>;

    /// Create a note, returning it with guid and USN assigned
    async fn create_note(&self, note: &Note, ctx: &RequestContext) -> Result<Note>;

    /// Update a note, returning it with the new USN
    async fn update_note(&self, note: &Note, ctx: &RequestContext) -> Result<Note>;

    /// Create a notebook
    async fn create_notebook(&self, notebook: &Notebook, ctx: &RequestContext)
        -> Result<Notebook>;

    /// Update a notebook
    async fn update_notebook(&self, notebook: &Notebook, ctx: &RequestContext)
        -> Result<Notebook>;

    /// Create a tag
    async fn create_tag(&self, tag: &Tag, ctx: &RequestContext) -> Result<Tag>;

    /// Update a tag
    async fn update_tag(&self, tag: &Tag, ctx: &RequestContext) -> Result<Tag>;

    /// Create a saved search
    async fn create_saved_search(
        &self,
        search: &SavedSearch,
        ctx: &RequestContext,
    ) -> Result<SavedSearch>;

    /// Update a saved search
    async fn update_saved_search(
        &self,
        search: &SavedSearch,
        ctx: &RequestContext,
    ) -> Result<SavedSearch>;
}

/// Hands out note stores
pub trait NoteStoreProvider: Send + Sync {
    /// Note store of the user's own account
    fn user_own_note_store(&self, auth: &AuthInfo) -> Result<Arc<dyn NoteStore>>;

    /// Note store holding a linked notebook
    fn linked_notebook_note_store(
        &self,
        linked_notebook: &LinkedNotebook,
        auth: &AuthInfo,
    ) -> Result<Arc<dyn NoteStore>>;
}

/// Remote user store
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Whether the remote service accepts this client's protocol version
    async fn check_version(
        &self,
        client_name: &str,
        major: u16,
        minor: u16,
        ctx: &RequestContext,
    ) -> Result<bool>;

    /// The authenticated user
    async fn get_user(&self, ctx: &RequestContext) -> Result<User>;

    /// Limits of the given service level
    async fn get_account_limits(
        &self,
        service_level: ServiceLevel,
        ctx: &RequestContext,
    ) -> Result<AccountLimits>;
}

/// Source of authentication tokens
#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    /// Authenticate to the user's own account
    async fn authenticate_account(&self, account: &Account, mode: AuthMode) -> Result<AuthInfo>;

    /// Authenticate to a linked notebook
    async fn authenticate_to_linked_notebook(
        &self,
        account: &Account,
        linked_notebook: &LinkedNotebook,
        mode: AuthMode,
    ) -> Result<AuthInfo>;

    /// Forget cached credentials of a user
    fn clear_user_cache(&self, user_id: i64);

    /// Forget cached credentials of a linked notebook
    fn clear_linked_notebook_cache(&self, linked_notebook_guid: &str);

    /// Forget every cached credential
    fn clear_all_caches(&self);
}
