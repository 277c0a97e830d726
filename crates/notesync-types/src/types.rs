//! Core data types for notesync
//!
//! This module provides the data model shared by the local store, the remote
//! note service client and the synchronization engine: identifiers, the six
//! synchronizable item kinds, sync chunks and the account/authentication
//! records.

use crate::config::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Server-assigned stable identifier of a remote-known item
pub type Guid = String;

/// Update sequence number stamped by the remote service
pub type Usn = i32;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Mime type of ink note resources
pub const INK_NOTE_MIME_TYPE: &str = "application/vnd.evernote.ink";

/// Permanent identifier of an item in the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(uuid::Uuid);

impl LocalId {
    /// Generate a fresh, never reused local id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Wrap an existing uuid
    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying uuid
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of a synchronizable item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemKind {
    /// Notebook shared from another account
    LinkedNotebook,
    /// Notebook
    Notebook,
    /// Tag
    Tag,
    /// Saved search
    SavedSearch,
    /// Note
    Note,
    /// Resource (note attachment)
    Resource,
}

impl ItemKind {
    /// All kinds in processing dependency order
    pub const ALL: [ItemKind; 6] = [
        ItemKind::LinkedNotebook,
        ItemKind::Notebook,
        ItemKind::Tag,
        ItemKind::SavedSearch,
        ItemKind::Note,
        ItemKind::Resource,
    ];

    /// Stable name, also used for on-disk file names
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinkedNotebook => "linked_notebooks",
            Self::Notebook => "notebooks",
            Self::Tag => "tags",
            Self::SavedSearch => "saved_searches",
            Self::Note => "notes",
            Self::Resource => "resources",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent USN stream: the user's own account or one linked notebook
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncScope {
    /// The account's own data
    UserOwn,
    /// Data of the linked notebook with the given guid
    LinkedNotebook(Guid),
}

impl SyncScope {
    /// Guid of the linked notebook, if this is a linked notebook scope
    pub fn linked_notebook_guid(&self) -> Option<&Guid> {
        match self {
            Self::UserOwn => None,
            Self::LinkedNotebook(guid) => Some(guid),
        }
    }

    /// Scope an item with the given linked notebook guid belongs to
    pub fn from_linked_notebook_guid(guid: Option<&Guid>) -> Self {
        guid.map_or(Self::UserOwn, |guid| Self::LinkedNotebook(guid.clone()))
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserOwn => f.write_str("user_own"),
            Self::LinkedNotebook(guid) => write!(f, "linked_notebook:{}", guid),
        }
    }
}

/// Notebook
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    /// Local id
    pub local_id: LocalId,
    /// Remote guid
    pub guid: Option<Guid>,
    /// Update sequence number
    pub usn: Option<Usn>,
    /// Notebook name, unique within its scope
    pub name: String,
    /// Whether this is the account's default notebook
    pub default_notebook: bool,
    /// Stack the notebook belongs to
    pub stack: Option<String>,
    /// Last update time
    pub updated: Option<Timestamp>,
    /// Linked notebook this notebook was shared through
    pub linked_notebook_guid: Option<Guid>,
    /// Whether the item has local changes not yet sent
    pub locally_modified: bool,
}

/// Tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Local id
    pub local_id: LocalId,
    /// Remote guid
    pub guid: Option<Guid>,
    /// Update sequence number
    pub usn: Option<Usn>,
    /// Tag name, unique within its scope
    pub name: String,
    /// Guid of the parent tag
    pub parent_guid: Option<Guid>,
    /// Local id of the parent tag
    pub parent_local_id: Option<LocalId>,
    /// Linked notebook this tag was shared through
    pub linked_notebook_guid: Option<Guid>,
    /// Whether the item has local changes not yet sent
    pub locally_modified: bool,
}

/// Saved search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSearch {
    /// Local id
    pub local_id: LocalId,
    /// Remote guid
    pub guid: Option<Guid>,
    /// Update sequence number
    pub usn: Option<Usn>,
    /// Search name, unique per account
    pub name: String,
    /// Search query
    pub query: String,
    /// Whether the item has local changes not yet sent
    pub locally_modified: bool,
}

/// Resource attached to a note
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Local id
    pub local_id: LocalId,
    /// Remote guid
    pub guid: Option<Guid>,
    /// Update sequence number
    pub usn: Option<Usn>,
    /// Guid of the owning note
    pub note_guid: Option<Guid>,
    /// Local id of the owning note
    pub note_local_id: Option<LocalId>,
    /// Mime type
    pub mime: String,
    /// Body, absent when only metadata was synchronized
    pub data: Option<Vec<u8>>,
    /// Hex encoded hash of the body
    pub data_hash: Option<String>,
    /// Linked notebook the owning note was shared through
    pub linked_notebook_guid: Option<Guid>,
    /// Whether the item has local changes not yet sent
    pub locally_modified: bool,
}

/// Note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Local id
    pub local_id: LocalId,
    /// Remote guid
    pub guid: Option<Guid>,
    /// Update sequence number
    pub usn: Option<Usn>,
    /// Title
    pub title: String,
    /// Markup content, absent when only metadata was synchronized
    pub content: Option<String>,
    /// Guid of the notebook holding the note
    pub notebook_guid: Option<Guid>,
    /// Local id of the notebook holding the note
    pub notebook_local_id: Option<LocalId>,
    /// Guids of the note's tags
    pub tag_guids: Vec<Guid>,
    /// Local ids of the note's tags
    pub tag_local_ids: Vec<LocalId>,
    /// Attachments
    pub resources: Vec<Resource>,
    /// Creation time
    pub created: Option<Timestamp>,
    /// Last update time
    pub updated: Option<Timestamp>,
    /// False for notes moved to trash
    pub active: bool,
    /// PNG thumbnail
    pub thumbnail: Option<Vec<u8>>,
    /// Guid of the remote note this local copy was split off from on conflict
    pub conflict_source_note_guid: Option<Guid>,
    /// Linked notebook the note was shared through
    pub linked_notebook_guid: Option<Guid>,
    /// Whether the item has local changes not yet sent
    pub locally_modified: bool,
}

impl Default for Note {
    fn default() -> Self {
        Self {
            local_id: LocalId::new(),
            guid: None,
            usn: None,
            title: String::new(),
            content: None,
            notebook_guid: None,
            notebook_local_id: None,
            tag_guids: Vec::new(),
            tag_local_ids: Vec::new(),
            resources: Vec::new(),
            created: None,
            updated: None,
            active: true,
            thumbnail: None,
            conflict_source_note_guid: None,
            linked_notebook_guid: None,
            locally_modified: false,
        }
    }
}

impl Note {
    /// Size of the note content in bytes
    pub fn content_size(&self) -> usize {
        self.content.as_ref().map_or(0, String::len)
    }
}

/// Notebook shared from another account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedNotebook {
    /// Local id
    pub local_id: LocalId,
    /// Remote guid
    pub guid: Option<Guid>,
    /// Update sequence number
    pub usn: Option<Usn>,
    /// Name under which the notebook is shared
    pub share_name: String,
    /// Owner's username
    pub username: String,
    /// Shard of the owner's account
    pub shard_id: String,
    /// Global id of the shared notebook
    pub shared_notebook_global_id: Option<String>,
    /// Note store url of the owner's account
    pub note_store_url: String,
    /// Whether the item has local changes not yet sent
    pub locally_modified: bool,
}

/// Any synchronizable item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Item {
    /// Linked notebook
    LinkedNotebook(LinkedNotebook),
    /// Notebook
    Notebook(Notebook),
    /// Tag
    Tag(Tag),
    /// Saved search
    SavedSearch(SavedSearch),
    /// Note
    Note(Note),
    /// Resource
    Resource(Resource),
}

impl Item {
    /// Kind of the wrapped item
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::LinkedNotebook(_) => ItemKind::LinkedNotebook,
            Self::Notebook(_) => ItemKind::Notebook,
            Self::Tag(_) => ItemKind::Tag,
            Self::SavedSearch(_) => ItemKind::SavedSearch,
            Self::Note(_) => ItemKind::Note,
            Self::Resource(_) => ItemKind::Resource,
        }
    }

    /// Local id of the wrapped item
    pub fn local_id(&self) -> LocalId {
        match self {
            Self::LinkedNotebook(item) => item.local_id,
            Self::Notebook(item) => item.local_id,
            Self::Tag(item) => item.local_id,
            Self::SavedSearch(item) => item.local_id,
            Self::Note(item) => item.local_id,
            Self::Resource(item) => item.local_id,
        }
    }

    /// Guid of the wrapped item
    pub fn guid(&self) -> Option<&Guid> {
        match self {
            Self::LinkedNotebook(item) => item.guid.as_ref(),
            Self::Notebook(item) => item.guid.as_ref(),
            Self::Tag(item) => item.guid.as_ref(),
            Self::SavedSearch(item) => item.guid.as_ref(),
            Self::Note(item) => item.guid.as_ref(),
            Self::Resource(item) => item.guid.as_ref(),
        }
    }
}

/// Ordered batch of remote changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncChunk {
    /// Server time at which the chunk was produced
    pub current_time: Timestamp,
    /// Highest USN of the items in this chunk, absent for an empty chunk
    pub chunk_high_usn: Option<Usn>,
    /// Highest USN of the whole scope on the server
    pub update_count: Usn,
    /// New or updated notes, metadata only
    pub notes: Vec<Note>,
    /// New or updated notebooks
    pub notebooks: Vec<Notebook>,
    /// New or updated tags
    pub tags: Vec<Tag>,
    /// New or updated saved searches
    pub searches: Vec<SavedSearch>,
    /// New or updated resources, metadata only
    pub resources: Vec<Resource>,
    /// New or updated linked notebooks
    pub linked_notebooks: Vec<LinkedNotebook>,
    /// Guids of expunged notes
    pub expunged_notes: Vec<Guid>,
    /// Guids of expunged notebooks
    pub expunged_notebooks: Vec<Guid>,
    /// Guids of expunged tags
    pub expunged_tags: Vec<Guid>,
    /// Guids of expunged saved searches
    pub expunged_searches: Vec<Guid>,
    /// Guids of expunged linked notebooks
    pub expunged_linked_notebooks: Vec<Guid>,
}

impl SyncChunk {
    /// Whether the chunk carries neither updates nor expunges
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
            && self.notebooks.is_empty()
            && self.tags.is_empty()
            && self.searches.is_empty()
            && self.resources.is_empty()
            && self.linked_notebooks.is_empty()
            && self.expunged_notes.is_empty()
            && self.expunged_notebooks.is_empty()
            && self.expunged_tags.is_empty()
            && self.expunged_searches.is_empty()
            && self.expunged_linked_notebooks.is_empty()
    }
}

/// Remote synchronization state of a scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Server time
    pub current_time: Timestamp,
    /// Clients that last synced before this time must run a full sync
    pub full_sync_before: Timestamp,
    /// Highest USN of the scope
    pub update_count: Usn,
}

/// Selects what a filtered sync chunk request returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncChunkFilter {
    /// Include notes
    pub include_notes: bool,
    /// Include notebooks
    pub include_notebooks: bool,
    /// Include tags
    pub include_tags: bool,
    /// Include saved searches
    pub include_searches: bool,
    /// Include standalone resources
    pub include_resources: bool,
    /// Include linked notebooks
    pub include_linked_notebooks: bool,
    /// Include expunged guid lists
    pub include_expunged: bool,
    /// Include resource metadata embedded in notes
    pub include_note_resources: bool,
}

impl SyncChunkFilter {
    /// Filter used for the user's own account.
    ///
    /// Standalone resources are only requested in incremental mode; during
    /// a full sync they arrive embedded in their notes.
    pub fn user_own(full_sync: bool) -> Self {
        Self {
            include_notes: true,
            include_notebooks: true,
            include_tags: true,
            include_searches: true,
            include_resources: !full_sync,
            include_linked_notebooks: true,
            include_expunged: !full_sync,
            include_note_resources: true,
        }
    }
}

/// Which parts of a note or resource to download in full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteDataSpec {
    /// Include note content
    pub with_content: bool,
    /// Include resource bodies
    pub with_resources_data: bool,
    /// Include resource recognition data
    pub with_resources_recognition: bool,
    /// Include alternate resource data
    pub with_resources_alternate_data: bool,
}

impl NoteDataSpec {
    /// Everything needed to render the note offline
    pub fn full() -> Self {
        Self {
            with_content: true,
            with_resources_data: true,
            with_resources_recognition: true,
            with_resources_alternate_data: false,
        }
    }
}

/// Account being synchronized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account name
    pub name: String,
    /// Remote user id
    pub id: i64,
    /// Shard holding the account
    pub shard_id: String,
    /// Note store url of the account
    pub note_store_url: String,
}

impl Account {
    /// Name of the account's persistence directory
    pub fn persistence_dir_name(&self) -> String {
        format!("{}_{}", self.name, self.id)
    }
}

/// Cache policy for authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    /// Reuse cached credentials if available
    Cache,
    /// Always authenticate anew
    NoCache,
}

/// Result of an authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Authenticated user id
    pub user_id: i64,
    /// Token sent with every request
    pub auth_token: String,
    /// Shard id
    pub shard_id: String,
    /// Note store url
    pub note_store_url: String,
    /// When the token was issued
    pub authentication_time: Timestamp,
    /// When the token expires
    pub auth_token_expiration_time: Timestamp,
}

/// Service level of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceLevel {
    /// Free tier
    #[default]
    Basic,
    /// Plus tier
    Plus,
    /// Premium tier
    Premium,
    /// Business tier
    Business,
}

/// Remote user record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: i64,
    /// Username
    pub username: String,
    /// Display name
    pub name: Option<String>,
    /// Service level
    pub service_level: ServiceLevel,
}

/// Per-account limits enforced by the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLimits {
    /// Maximum note size in bytes
    pub note_size_max: i64,
    /// Maximum resource size in bytes
    pub resource_size_max: i64,
    /// Maximum number of notebooks
    pub user_notebooks_max: i32,
    /// Maximum number of tags
    pub user_tags_max: i32,
    /// Maximum number of saved searches
    pub user_saved_searches_max: i32,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            note_size_max: 25 * 1024 * 1024,
            resource_size_max: 25 * 1024 * 1024,
            user_notebooks_max: 250,
            user_tags_max: 100_000,
            user_saved_searches_max: 100,
        }
    }
}

/// Parameters carried by every remote call
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    /// Authentication token
    pub auth_token: String,
    /// Timeout of the request
    pub request_timeout: Duration,
    /// Retry policy the remote client applies
    pub retry: RetryConfig,
}
