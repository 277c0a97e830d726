//! Conflict resolution between remote and local versions of an item

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use notesync_types::{
    Error, LinkedNotebook, LocalId, Note, Notebook, Result, SavedSearch, SyncItem, Tag,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Suffix appended to the name of a relocated local copy
pub const CONFLICTING_SUFFIX: &str = " - conflicting";

/// What to do when a remote item collides with a local one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution<T> {
    /// Overwrite the local item with the remote version
    UseTheirs,
    /// Keep the local item, drop the remote version
    UseMine,
    /// The items are unrelated; add the remote one next to the local one
    IgnoreMine,
    /// Relocate the local item as the given copy, then write the remote version
    MoveMine(T),
    /// Replace the local item with the given renamed version, keeping its
    /// identity, then add the remote version next to it
    RenameMine(T),
}

/// Discriminant of a [`ConflictResolution`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictResolutionKind {
    /// See [`ConflictResolution::UseTheirs`]
    UseTheirs,
    /// See [`ConflictResolution::UseMine`]
    UseMine,
    /// See [`ConflictResolution::IgnoreMine`]
    IgnoreMine,
    /// See [`ConflictResolution::MoveMine`]
    MoveMine,
    /// See [`ConflictResolution::RenameMine`]
    RenameMine,
}

impl<T> ConflictResolution<T> {
    /// Discriminant of this resolution
    pub fn kind(&self) -> ConflictResolutionKind {
        match self {
            Self::UseTheirs => ConflictResolutionKind::UseTheirs,
            Self::UseMine => ConflictResolutionKind::UseMine,
            Self::IgnoreMine => ConflictResolutionKind::IgnoreMine,
            Self::MoveMine(_) => ConflictResolutionKind::MoveMine,
            Self::RenameMine(_) => ConflictResolutionKind::RenameMine,
        }
    }

    /// Whether applying this resolution writes the remote version
    pub fn writes_theirs(&self) -> bool {
        !matches!(self, Self::UseMine)
    }
}

/// Decides between a remote item (`theirs`) and a colliding local one (`mine`).
///
/// Implementations must be deterministic and must not mutate either input.
/// A resolver returns an error only when the inputs violate its contract.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Resolve a notebook conflict
    async fn resolve_notebook_conflict(
        &self,
        theirs: &Notebook,
        mine: &Notebook,
    ) -> Result<ConflictResolution<Notebook>>;

    /// Resolve a note conflict
    async fn resolve_note_conflict(&self, theirs: &Note, mine: &Note)
        -> Result<ConflictResolution<Note>>;

    /// Resolve a saved search conflict
    async fn resolve_saved_search_conflict(
        &self,
        theirs: &SavedSearch,
        mine: &SavedSearch,
    ) -> Result<ConflictResolution<SavedSearch>>;

    /// Resolve a tag conflict
    async fn resolve_tag_conflict(&self, theirs: &Tag, mine: &Tag)
        -> Result<ConflictResolution<Tag>>;
}

/// Default resolver.
///
/// Items with the same guid are decided by USN and the local modification
/// flag. Items that only share a name are either unrelated (different
/// linked notebook scope) or the local one is renamed in place, keeping its
/// local id and guid, so both can exist side by side.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleConflictResolver;

impl SimpleConflictResolver {
    /// Create a new resolver
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConflictResolver for SimpleConflictResolver {
    async fn resolve_notebook_conflict(
        &self,
        theirs: &Notebook,
        mine: &Notebook,
    ) -> Result<ConflictResolution<Notebook>> {
        let resolution = resolve_named(theirs, mine)?;
        Ok(match resolution {
            ConflictResolution::MoveMine(mut copy) => {
                copy.default_notebook = false;
                ConflictResolution::MoveMine(copy)
            }
            ConflictResolution::RenameMine(mut renamed) => {
                renamed.default_notebook = false;
                ConflictResolution::RenameMine(renamed)
            }
            other => other,
        })
    }

    async fn resolve_note_conflict(
        &self,
        theirs: &Note,
        mine: &Note,
    ) -> Result<ConflictResolution<Note>> {
        let their_guid = require_their_guid(theirs)?;
        let Some(my_guid) = mine.guid.as_ref() else {
            return Err(Error::invalid_argument(
                "local note has neither guid nor name to match by",
            ));
        };

        if my_guid != their_guid {
            return Ok(ConflictResolution::IgnoreMine);
        }

        Ok(resolve_by_usn(theirs, mine, || conflicting_note_copy(mine, their_guid)))
    }

    async fn resolve_saved_search_conflict(
        &self,
        theirs: &SavedSearch,
        mine: &SavedSearch,
    ) -> Result<ConflictResolution<SavedSearch>> {
        resolve_named(theirs, mine)
    }

    async fn resolve_tag_conflict(&self, theirs: &Tag, mine: &Tag) -> Result<ConflictResolution<Tag>> {
        resolve_named(theirs, mine)
    }
}

fn require_their_guid<T: SyncItem>(theirs: &T) -> Result<&String> {
    theirs.guid().ok_or_else(|| {
        Error::invalid_argument(format!("remote {} carries no guid", T::KIND))
    })
}

/// Resolution between two versions of the same remote item.
///
/// `move_mine` builds the relocated copy when the local edits must survive.
fn resolve_by_usn<T: SyncItem>(
    theirs: &T,
    mine: &T,
    move_mine: impl FnOnce() -> T,
) -> ConflictResolution<T> {
    match (mine.usn(), theirs.usn()) {
        (Some(my_usn), Some(their_usn)) if my_usn >= their_usn => ConflictResolution::UseMine,
        _ if !mine.is_locally_modified() => ConflictResolution::UseTheirs,
        _ => ConflictResolution::MoveMine(move_mine()),
    }
}

/// Resolution for kinds with a natural key unique within their scope
fn resolve_named<T: SyncItem>(theirs: &T, mine: &T) -> Result<ConflictResolution<T>> {
    let their_guid = require_their_guid(theirs)?;

    if mine.guid().is_none() && mine.name().is_none() {
        return Err(Error::invalid_argument(format!(
            "local {} has neither guid nor name to match by",
            T::KIND
        )));
    }

    if mine.guid() == Some(their_guid) {
        return Ok(resolve_by_usn(theirs, mine, || conflicting_copy(mine)));
    }

    // Matched by name only
    if mine.linked_notebook_guid() != theirs.linked_notebook_guid() {
        debug!(kind = %T::KIND, guid = %their_guid, "Name collision across scopes");
        return Ok(ConflictResolution::IgnoreMine);
    }

    debug!(kind = %T::KIND, guid = %their_guid, "Renaming local item out of the way");
    Ok(ConflictResolution::RenameMine(renamed_in_place(mine)))
}

/// `mine` under a suffixed name, with its local id and sync identity intact
fn renamed_in_place<T: SyncItem>(mine: &T) -> T {
    let mut renamed = mine.clone();
    renamed.set_locally_modified(true);
    if let Some(name) = mine.name() {
        renamed.set_name(format!("{}{}", name, CONFLICTING_SUFFIX));
    }
    renamed
}

/// Local-only copy of `mine` under a fresh local id
fn conflicting_copy<T: SyncItem>(mine: &T) -> T {
    let mut copy = mine.clone();
    copy.set_local_id(LocalId::new());
    copy.clear_sync_identity();
    copy.set_locally_modified(true);
    if let Some(name) = mine.name() {
        copy.set_name(format!("{}{}", name, CONFLICTING_SUFFIX));
    }
    copy
}

fn conflicting_note_copy(mine: &Note, their_guid: &str) -> Note {
    let mut copy = conflicting_copy(mine);
    copy.title = format!("{}{}", mine.title, CONFLICTING_SUFFIX);
    copy.conflict_source_note_guid = Some(their_guid.to_string());
    copy.thumbnail = None;
    let note_local_id = copy.local_id;
    for resource in &mut copy.resources {
        resource.local_id = LocalId::new();
        resource.guid = None;
        resource.usn = None;
        resource.note_guid = None;
        resource.note_local_id = Some(note_local_id);
        resource.locally_modified = true;
    }
    copy
}

/// Item kinds that can collide with a local item during download
pub trait ResolvableItem: SyncItem {
    /// Decide between `theirs` and `mine` with the matching resolver method
    fn resolve<'a>(
        resolver: &'a dyn ConflictResolver,
        theirs: &'a Self,
        mine: &'a Self,
    ) -> BoxFuture<'a, Result<ConflictResolution<Self>>>;
}

impl ResolvableItem for Notebook {
    fn resolve<'a>(
        resolver: &'a dyn ConflictResolver,
        theirs: &'a Self,
        mine: &'a Self,
    ) -> BoxFuture<'a, Result<ConflictResolution<Self>>> {
        resolver.resolve_notebook_conflict(theirs, mine)
    }
}

impl ResolvableItem for Tag {
    fn resolve<'a>(
        resolver: &'a dyn ConflictResolver,
        theirs: &'a Self,
        mine: &'a Self,
    ) -> BoxFuture<'a, Result<ConflictResolution<Self>>> {
        resolver.resolve_tag_conflict(theirs, mine)
    }
}

impl ResolvableItem for SavedSearch {
    fn resolve<'a>(
        resolver: &'a dyn ConflictResolver,
        theirs: &'a Self,
        mine: &'a Self,
    ) -> BoxFuture<'a, Result<ConflictResolution<Self>>> {
        resolver.resolve_saved_search_conflict(theirs, mine)
    }
}

impl ResolvableItem for Note {
    fn resolve<'a>(
        resolver: &'a dyn ConflictResolver,
        theirs: &'a Self,
        mine: &'a Self,
    ) -> BoxFuture<'a, Result<ConflictResolution<Self>>> {
        resolver.resolve_note_conflict(theirs, mine)
    }
}

// Linked notebooks are never edited locally in a way that could conflict.
impl ResolvableItem for LinkedNotebook {
    fn resolve<'a>(
        _resolver: &'a dyn ConflictResolver,
        theirs: &'a Self,
        mine: &'a Self,
    ) -> BoxFuture<'a, Result<ConflictResolution<Self>>> {
        let resolution = match (mine.usn, theirs.usn) {
            (Some(my_usn), Some(their_usn)) if my_usn >= their_usn => ConflictResolution::UseMine,
            _ => ConflictResolution::UseTheirs,
        };
        future::ready(Ok(resolution)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_types::Resource;
    use proptest::prelude::*;
    use rstest::rstest;

    fn note(guid: Option<&str>, usn: Option<i32>, locally_modified: bool) -> Note {
        Note {
            guid: guid.map(str::to_string),
            usn,
            title: "Groceries".to_string(),
            content: Some("<en-note>milk</en-note>".to_string()),
            locally_modified,
            ..Default::default()
        }
    }

    fn notebook(guid: Option<&str>, name: &str, linked: Option<&str>) -> Notebook {
        Notebook {
            guid: guid.map(str::to_string),
            usn: Some(5),
            name: name.to_string(),
            linked_notebook_guid: linked.map(str::to_string),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(Some(10), 10, false, ConflictResolutionKind::UseMine)]
    #[case(Some(11), 10, true, ConflictResolutionKind::UseMine)]
    #[case(Some(9), 10, false, ConflictResolutionKind::UseTheirs)]
    #[case(None, 10, false, ConflictResolutionKind::UseTheirs)]
    #[case(Some(9), 10, true, ConflictResolutionKind::MoveMine)]
    #[tokio::test]
    async fn test_note_resolution_by_usn(
        #[case] my_usn: Option<i32>,
        #[case] their_usn: i32,
        #[case] locally_modified: bool,
        #[case] expected: ConflictResolutionKind,
    ) {
        let resolver = SimpleConflictResolver::new();
        let theirs = note(Some("n1"), Some(their_usn), false);
        let mine = note(Some("n1"), my_usn, locally_modified);

        let resolution = resolver.resolve_note_conflict(&theirs, &mine).await.unwrap();
        assert_eq!(resolution.kind(), expected);
    }

    #[tokio::test]
    async fn test_note_with_other_guid_is_ignored() {
        let resolver = SimpleConflictResolver::new();
        let theirs = note(Some("n1"), Some(3), false);
        let mine = note(Some("n2"), Some(1), true);

        let resolution = resolver.resolve_note_conflict(&theirs, &mine).await.unwrap();
        assert_eq!(resolution, ConflictResolution::IgnoreMine);
    }

    #[tokio::test]
    async fn test_moved_note_copy_is_severed() {
        let resolver = SimpleConflictResolver::new();
        let theirs = note(Some("n1"), Some(20), false);
        let mut mine = note(Some("n1"), Some(10), true);
        mine.resources.push(Resource {
            guid: Some("r1".to_string()),
            usn: Some(10),
            note_guid: Some("n1".to_string()),
            note_local_id: Some(mine.local_id),
            mime: "image/png".to_string(),
            ..Default::default()
        });

        let ConflictResolution::MoveMine(copy) =
            resolver.resolve_note_conflict(&theirs, &mine).await.unwrap()
        else {
            panic!("expected MoveMine");
        };

        assert_ne!(copy.local_id, mine.local_id);
        assert!(copy.guid.is_none());
        assert!(copy.usn.is_none());
        assert!(copy.locally_modified);
        assert_eq!(copy.conflict_source_note_guid.as_deref(), Some("n1"));
        assert_eq!(copy.title, "Groceries - conflicting");
        assert_eq!(copy.content, mine.content);

        let resource = &copy.resources[0];
        assert!(resource.guid.is_none());
        assert_eq!(resource.note_local_id, Some(copy.local_id));
        assert_ne!(resource.local_id, mine.resources[0].local_id);
    }

    #[tokio::test]
    async fn test_contract_violations() {
        let resolver = SimpleConflictResolver::new();

        let theirs = note(None, Some(1), false);
        let mine = note(Some("n1"), Some(1), false);
        let error = resolver.resolve_note_conflict(&theirs, &mine).await.unwrap_err();
        assert!(matches!(error, Error::InvalidArgument { .. }));

        let theirs = note(Some("n1"), Some(1), false);
        let mine = note(None, None, true);
        let error = resolver.resolve_note_conflict(&theirs, &mine).await.unwrap_err();
        assert!(matches!(error, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_notebook_name_collision_across_scopes() {
        let resolver = SimpleConflictResolver::new();
        let theirs = notebook(Some("nb1"), "Work", Some("ln1"));
        let mine = notebook(Some("nb2"), "Work", None);

        let resolution = resolver.resolve_notebook_conflict(&theirs, &mine).await.unwrap();
        assert_eq!(resolution, ConflictResolution::IgnoreMine);
    }

    #[rstest]
    #[case(None)]
    #[case(Some("nb2"))]
    #[tokio::test]
    async fn test_notebook_name_collision_in_scope_renames_mine(#[case] my_guid: Option<&str>) {
        let resolver = SimpleConflictResolver::new();
        let theirs = notebook(Some("nb1"), "Work", None);
        let mut mine = notebook(my_guid, "Work", None);
        mine.default_notebook = true;

        let ConflictResolution::RenameMine(renamed) =
            resolver.resolve_notebook_conflict(&theirs, &mine).await.unwrap()
        else {
            panic!("expected RenameMine");
        };
        assert_eq!(renamed.name, "Work - conflicting");
        assert!(!renamed.default_notebook);
        assert!(renamed.locally_modified);
        assert_eq!(renamed.local_id, mine.local_id);
        assert_eq!(renamed.guid, mine.guid);
        assert_eq!(renamed.usn, mine.usn);
    }

    #[tokio::test]
    async fn test_tag_same_guid_modified_moves_mine() {
        let resolver = SimpleConflictResolver::new();
        let theirs = Tag {
            guid: Some("t1".to_string()),
            usn: Some(9),
            name: "urgent".to_string(),
            ..Default::default()
        };
        let mine = Tag {
            usn: Some(4),
            locally_modified: true,
            ..theirs.clone()
        };

        let ConflictResolution::MoveMine(copy) =
            resolver.resolve_tag_conflict(&theirs, &mine).await.unwrap()
        else {
            panic!("expected MoveMine");
        };
        assert_ne!(copy.local_id, mine.local_id);
        assert!(copy.guid.is_none());
        assert_eq!(copy.name, "urgent - conflicting");
    }

    #[tokio::test]
    async fn test_saved_search_same_guid_unmodified() {
        let resolver = SimpleConflictResolver::new();
        let theirs = SavedSearch {
            guid: Some("s1".to_string()),
            usn: Some(7),
            name: "Todo".to_string(),
            query: "tag:todo".to_string(),
            ..Default::default()
        };
        let mine = SavedSearch {
            usn: Some(3),
            ..theirs.clone()
        };

        let resolution = resolver
            .resolve_saved_search_conflict(&theirs, &mine)
            .await
            .unwrap();
        assert_eq!(resolution, ConflictResolution::UseTheirs);
    }

    proptest! {
        #[test]
        fn test_tag_resolution_is_deterministic(
            my_usn in proptest::option::of(0i32..100),
            their_usn in 0i32..100,
            locally_modified in any::<bool>(),
            same_guid in any::<bool>(),
            same_scope in any::<bool>(),
        ) {
            let theirs = Tag {
                guid: Some("t1".to_string()),
                usn: Some(their_usn),
                name: "urgent".to_string(),
                ..Default::default()
            };
            let mine = Tag {
                guid: Some(if same_guid { "t1" } else { "t2" }.to_string()),
                usn: my_usn,
                name: "urgent".to_string(),
                linked_notebook_guid: (!same_scope).then(|| "ln".to_string()),
                locally_modified,
                ..Default::default()
            };
            let before = (theirs.clone(), mine.clone());

            let resolver = SimpleConflictResolver::new();
            let first = tokio_test::block_on(resolver.resolve_tag_conflict(&theirs, &mine)).unwrap();
            let second = tokio_test::block_on(resolver.resolve_tag_conflict(&theirs, &mine)).unwrap();

            prop_assert_eq!(first.kind(), second.kind());
            prop_assert_eq!(before, (theirs, mine));
        }
    }
}
