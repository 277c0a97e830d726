//! Typed helpers over the type-erased [`LocalStore`]

use crate::conflict::ConflictResolution;
use notesync_types::{Error, Item, ListFilter, LocalId, LocalStore, Result, SyncItem};
use tracing::debug;

fn downcast<T: SyncItem>(item: Option<Item>) -> Result<Option<T>> {
    match item {
        None => Ok(None),
        Some(item) => {
            let kind = item.kind();
            T::from_item(item).map(Some).ok_or_else(|| {
                Error::local_store(format!(
                    "local store returned a {} where a {} was expected",
                    kind,
                    T::KIND
                ))
            })
        }
    }
}

pub(crate) async fn find_by_guid<T: SyncItem>(
    store: &dyn LocalStore,
    guid: &str,
) -> Result<Option<T>> {
    downcast(store.find_by_guid(T::KIND, guid).await?)
}

pub(crate) async fn find_by_local_id<T: SyncItem>(
    store: &dyn LocalStore,
    local_id: LocalId,
) -> Result<Option<T>> {
    downcast(store.find_by_local_id(T::KIND, local_id).await?)
}

/// Local item colliding with a remote one: same guid, or same name in the same scope
pub(crate) async fn find_conflicting<T: SyncItem>(
    store: &dyn LocalStore,
    theirs: &T,
) -> Result<Option<T>> {
    if let Some(guid) = theirs.guid() {
        if let Some(mine) = find_by_guid::<T>(store, guid).await? {
            return Ok(Some(mine));
        }
    }

    match theirs.name() {
        Some(name) => downcast(
            store
                .find_by_name(
                    T::KIND,
                    name,
                    theirs.linked_notebook_guid().map(String::as_str),
                )
                .await?,
        ),
        None => Ok(None),
    }
}

pub(crate) async fn list<T: SyncItem>(store: &dyn LocalStore, filter: &ListFilter) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for item in store.list(T::KIND, filter).await? {
        items.extend(downcast::<T>(Some(item))?);
    }
    Ok(items)
}

pub(crate) async fn put<T: SyncItem>(store: &dyn LocalStore, item: T) -> Result<()> {
    store.put(item.into_item()).await
}

/// How a remote item ended up in the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Added,
    Updated,
    Unchanged,
}

/// Write a remote item that has no local counterpart
pub(crate) async fn add<T: SyncItem>(store: &dyn LocalStore, mut theirs: T) -> Result<Applied> {
    theirs.set_locally_modified(false);
    put(store, theirs).await?;
    Ok(Applied::Added)
}

/// Apply a conflict resolution between `theirs` and the local `mine`
pub(crate) async fn apply_resolution<T: SyncItem>(
    store: &dyn LocalStore,
    mut theirs: T,
    mine: &T,
    resolution: ConflictResolution<T>,
) -> Result<Applied> {
    match resolution {
        ConflictResolution::UseMine => Ok(Applied::Unchanged),
        ConflictResolution::UseTheirs => {
            theirs.set_local_id(mine.local_id());
            theirs.set_locally_modified(false);
            put(store, theirs).await?;
            Ok(Applied::Updated)
        }
        ConflictResolution::IgnoreMine => {
            if theirs.local_id() == mine.local_id() {
                theirs.set_local_id(LocalId::new());
            }
            add(store, theirs).await
        }
        ConflictResolution::MoveMine(copy) => {
            debug!(
                kind = %T::KIND,
                from = %mine.local_id(),
                to = %copy.local_id(),
                "Relocating local item"
            );
            put(store, copy).await?;
            theirs.set_local_id(mine.local_id());
            theirs.set_locally_modified(false);
            put(store, theirs).await?;
            Ok(Applied::Updated)
        }
        ConflictResolution::RenameMine(renamed) => {
            debug!(
                kind = %T::KIND,
                local_id = %mine.local_id(),
                "Renaming local item in place"
            );
            put(store, renamed).await?;
            if theirs.local_id() == mine.local_id() {
                theirs.set_local_id(LocalId::new());
            }
            add(store, theirs).await
        }
    }
}
