//! Status accumulators reported by the synchronization components
//!
//! Every status is mergeable so that a resumed or repeated run can be folded
//! into the result of an earlier one. Merging adds counters, concatenates
//! failure lists, keeps the highest USN per guid and keeps the first stop
//! error encountered.

use crate::error::Error;
use crate::traits::SyncItem;
use crate::types::{Guid, Item, ItemKind, Note, Notebook, Resource, SavedSearch, Tag, Usn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Accumulate the content of another value of the same type
pub trait Merge {
    /// Merge `other` into `self`
    fn merge(&mut self, other: &Self);
}

/// Condition that halts the whole sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopSynchronizationError {
    /// The remote service throttled the client
    RateLimitReached {
        /// Seconds to wait before retrying, if reported
        duration_secs: Option<u64>,
    },
    /// The authentication token expired
    AuthenticationExpired,
}

impl Merge for Option<StopSynchronizationError> {
    fn merge(&mut self, other: &Self) {
        if self.is_none() {
            *self = *other;
        }
    }
}

/// An item that could not be handled, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure<T> {
    /// The failed item
    pub item: T,
    /// Why it failed
    pub error: Error,
}

impl<T> ItemFailure<T> {
    /// Create a new failure record
    pub fn new(item: T, error: Error) -> Self {
        Self { item, error }
    }
}

/// A guid that could not be expunged, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidFailure {
    /// Kind of the item
    pub kind: ItemKind,
    /// Guid of the item
    pub guid: Guid,
    /// Why it failed
    pub error: Error,
}

/// Processing counters of one category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounters {
    /// New or updated items received
    pub total: u64,
    /// Expunged guids received
    pub total_expunged: u64,
    /// Items added to the local store
    pub added: u64,
    /// Items updated in the local store
    pub updated: u64,
    /// Items expunged from the local store
    pub expunged: u64,
    /// Items that failed to be written
    pub failed_to_process: u64,
    /// Guids that failed to be expunged
    pub failed_to_expunge: u64,
}

impl Merge for CategoryCounters {
    fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.total_expunged += other.total_expunged;
        self.added += other.added;
        self.updated += other.updated;
        self.expunged += other.expunged;
        self.failed_to_process += other.failed_to_process;
        self.failed_to_expunge += other.failed_to_expunge;
    }
}

/// Counters of the categories carried entirely by sync chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncChunksDataCounters {
    /// Linked notebooks
    pub linked_notebooks: CategoryCounters,
    /// Notebooks
    pub notebooks: CategoryCounters,
    /// Tags
    pub tags: CategoryCounters,
    /// Saved searches
    pub saved_searches: CategoryCounters,
}

impl SyncChunksDataCounters {
    /// Counters of the given kind; notes and resources have their own statuses
    pub fn counters(&self, kind: ItemKind) -> Option<&CategoryCounters> {
        match kind {
            ItemKind::LinkedNotebook => Some(&self.linked_notebooks),
            ItemKind::Notebook => Some(&self.notebooks),
            ItemKind::Tag => Some(&self.tags),
            ItemKind::SavedSearch => Some(&self.saved_searches),
            ItemKind::Note | ItemKind::Resource => None,
        }
    }

    /// Mutable counters of the given kind
    pub fn counters_mut(&mut self, kind: ItemKind) -> Option<&mut CategoryCounters> {
        match kind {
            ItemKind::LinkedNotebook => Some(&mut self.linked_notebooks),
            ItemKind::Notebook => Some(&mut self.notebooks),
            ItemKind::Tag => Some(&mut self.tags),
            ItemKind::SavedSearch => Some(&mut self.saved_searches),
            ItemKind::Note | ItemKind::Resource => None,
        }
    }
}

impl Merge for SyncChunksDataCounters {
    fn merge(&mut self, other: &Self) {
        self.linked_notebooks.merge(&other.linked_notebooks);
        self.notebooks.merge(&other.notebooks);
        self.tags.merge(&other.tags);
        self.saved_searches.merge(&other.saved_searches);
    }
}

/// Outcome of processing one category of downloaded items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItemsStatus<T> {
    /// Items added to the local store
    pub total_new: u64,
    /// Items updated in the local store
    pub total_updated: u64,
    /// Items expunged from the local store
    pub total_expunged: u64,
    /// Items whose full data could not be downloaded
    pub failed_to_download: Vec<ItemFailure<T>>,
    /// Items that could not be written to the local store
    pub failed_to_process: Vec<ItemFailure<T>>,
    /// Guids that could not be expunged
    pub guids_failed_to_expunge: Vec<GuidFailure>,
    /// Guids handled successfully, with the USN that was applied
    pub processed_guids_and_usns: BTreeMap<Guid, Usn>,
    /// Guids left pending because the run was cancelled or stopped
    pub cancelled_guids_and_usns: BTreeMap<Guid, Usn>,
    /// Guids expunged from the local store
    pub expunged_guids: BTreeSet<Guid>,
    /// Set when the run must halt
    pub stop_synchronization_error: Option<StopSynchronizationError>,
}

impl<T> Default for DownloadItemsStatus<T> {
    fn default() -> Self {
        Self {
            total_new: 0,
            total_updated: 0,
            total_expunged: 0,
            failed_to_download: Vec::new(),
            failed_to_process: Vec::new(),
            guids_failed_to_expunge: Vec::new(),
            processed_guids_and_usns: BTreeMap::new(),
            cancelled_guids_and_usns: BTreeMap::new(),
            expunged_guids: BTreeSet::new(),
            stop_synchronization_error: None,
        }
    }
}

impl<T> DownloadItemsStatus<T> {
    /// Create an empty status
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no item failed and the run was not stopped
    pub fn is_clean(&self) -> bool {
        self.failed_to_download.is_empty()
            && self.failed_to_process.is_empty()
            && self.guids_failed_to_expunge.is_empty()
            && self.stop_synchronization_error.is_none()
    }
}

impl<T: SyncItem> DownloadItemsStatus<T> {
    /// Fold this status into per-kind counters and type-erased failure lists
    pub fn fold_into(
        self,
        counters: &mut CategoryCounters,
        failed_items: &mut Vec<ItemFailure<Item>>,
        failed_expunges: &mut Vec<GuidFailure>,
    ) {
        counters.added += self.total_new;
        counters.updated += self.total_updated;
        counters.expunged += self.total_expunged;
        counters.failed_to_process +=
            (self.failed_to_process.len() + self.failed_to_download.len()) as u64;
        counters.failed_to_expunge += self.guids_failed_to_expunge.len() as u64;
        failed_items.extend(
            self.failed_to_download
                .into_iter()
                .chain(self.failed_to_process)
                .map(|failure| ItemFailure::new(failure.item.into_item(), failure.error)),
        );
        failed_expunges.extend(self.guids_failed_to_expunge);
    }
}

impl<T: Clone> Merge for DownloadItemsStatus<T> {
    fn merge(&mut self, other: &Self) {
        self.total_new += other.total_new;
        self.total_updated += other.total_updated;
        self.total_expunged += other.total_expunged;
        self.failed_to_download
            .extend(other.failed_to_download.iter().cloned());
        self.failed_to_process
            .extend(other.failed_to_process.iter().cloned());
        self.guids_failed_to_expunge
            .extend(other.guids_failed_to_expunge.iter().cloned());
        merge_max_usns(
            &mut self.processed_guids_and_usns,
            &other.processed_guids_and_usns,
        );
        merge_max_usns(
            &mut self.cancelled_guids_and_usns,
            &other.cancelled_guids_and_usns,
        );
        self.expunged_guids
            .extend(other.expunged_guids.iter().cloned());
        self.stop_synchronization_error
            .merge(&other.stop_synchronization_error);
    }
}

fn merge_max_usns(target: &mut BTreeMap<Guid, Usn>, source: &BTreeMap<Guid, Usn>) {
    for (guid, usn) in source {
        target
            .entry(guid.clone())
            .and_modify(|existing| *existing = (*existing).max(*usn))
            .or_insert(*usn);
    }
}

/// Outcome of downloading notes
pub type DownloadNotesStatus = DownloadItemsStatus<Note>;

/// Outcome of downloading resources
pub type DownloadResourcesStatus = DownloadItemsStatus<Resource>;

/// Outcome of sending local changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendStatus {
    /// Notes the sender tried to send
    pub total_attempted_to_send_notes: u64,
    /// Notebooks the sender tried to send
    pub total_attempted_to_send_notebooks: u64,
    /// Tags the sender tried to send
    pub total_attempted_to_send_tags: u64,
    /// Saved searches the sender tried to send
    pub total_attempted_to_send_saved_searches: u64,
    /// Notes accepted by the remote service
    pub total_successfully_sent_notes: u64,
    /// Notebooks accepted by the remote service
    pub total_successfully_sent_notebooks: u64,
    /// Tags accepted by the remote service
    pub total_successfully_sent_tags: u64,
    /// Saved searches accepted by the remote service
    pub total_successfully_sent_saved_searches: u64,
    /// Notes that failed to be sent
    pub failed_to_send_notes: Vec<ItemFailure<Note>>,
    /// Notebooks that failed to be sent
    pub failed_to_send_notebooks: Vec<ItemFailure<Notebook>>,
    /// Tags that failed to be sent
    pub failed_to_send_tags: Vec<ItemFailure<Tag>>,
    /// Saved searches that failed to be sent
    pub failed_to_send_saved_searches: Vec<ItemFailure<SavedSearch>>,
    /// Set when the run must halt
    pub stop_synchronization_error: Option<StopSynchronizationError>,
    /// Another download pass is needed before the account is consistent
    pub need_to_repeat_incremental_sync: bool,
}

impl SendStatus {
    /// Create an empty status
    pub fn new() -> Self {
        Self::default()
    }
}

impl Merge for SendStatus {
    fn merge(&mut self, other: &Self) {
        self.total_attempted_to_send_notes += other.total_attempted_to_send_notes;
        self.total_attempted_to_send_notebooks += other.total_attempted_to_send_notebooks;
        self.total_attempted_to_send_tags += other.total_attempted_to_send_tags;
        self.total_attempted_to_send_saved_searches +=
            other.total_attempted_to_send_saved_searches;
        self.total_successfully_sent_notes += other.total_successfully_sent_notes;
        self.total_successfully_sent_notebooks += other.total_successfully_sent_notebooks;
        self.total_successfully_sent_tags += other.total_successfully_sent_tags;
        self.total_successfully_sent_saved_searches +=
            other.total_successfully_sent_saved_searches;
        self.failed_to_send_notes
            .extend(other.failed_to_send_notes.iter().cloned());
        self.failed_to_send_notebooks
            .extend(other.failed_to_send_notebooks.iter().cloned());
        self.failed_to_send_tags
            .extend(other.failed_to_send_tags.iter().cloned());
        self.failed_to_send_saved_searches
            .extend(other.failed_to_send_saved_searches.iter().cloned());
        self.stop_synchronization_error
            .merge(&other.stop_synchronization_error);
        self.need_to_repeat_incremental_sync |= other.need_to_repeat_incremental_sync;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stop_error() -> impl Strategy<Value = Option<StopSynchronizationError>> {
        prop_oneof![
            Just(None),
            Just(Some(StopSynchronizationError::AuthenticationExpired)),
            proptest::option::of(0u64..600).prop_map(|duration_secs| Some(
                StopSynchronizationError::RateLimitReached { duration_secs }
            )),
        ]
    }

    prop_compose! {
        fn notes_status()(
            total_new in 0u64..50,
            total_updated in 0u64..50,
            total_expunged in 0u64..50,
            failed in proptest::collection::vec("[a-c]{1,2}", 0..3),
            processed in proptest::collection::btree_map("[a-e]", 0i32..100, 0..5),
            cancelled in proptest::collection::btree_map("[a-e]", 0i32..100, 0..3),
            expunged in proptest::collection::btree_set("[f-h]", 0..3),
            stop in stop_error(),
        ) -> DownloadNotesStatus {
            DownloadNotesStatus {
                total_new,
                total_updated,
                total_expunged,
                failed_to_download: Vec::new(),
                failed_to_process: failed
                    .into_iter()
                    .map(|title| ItemFailure::new(
                        Note { title, ..Default::default() },
                        Error::local_store("write failed"),
                    ))
                    .collect(),
                guids_failed_to_expunge: Vec::new(),
                processed_guids_and_usns: processed,
                cancelled_guids_and_usns: cancelled,
                expunged_guids: expunged,
                stop_synchronization_error: stop,
            }
        }
    }

    prop_compose! {
        fn send_status()(
            attempted in 0u64..20,
            sent in 0u64..20,
            repeat in any::<bool>(),
            stop in stop_error(),
        ) -> SendStatus {
            SendStatus {
                total_attempted_to_send_notes: attempted,
                total_attempted_to_send_tags: attempted / 2,
                total_successfully_sent_notes: sent,
                need_to_repeat_incremental_sync: repeat,
                stop_synchronization_error: stop,
                ..Default::default()
            }
        }
    }

    fn merged<T: Merge + Clone>(a: &T, b: &T) -> T {
        let mut result = a.clone();
        result.merge(b);
        result
    }

    proptest! {
        #[test]
        fn test_notes_status_merge_is_associative(
            a in notes_status(),
            b in notes_status(),
            c in notes_status(),
        ) {
            let left = merged(&merged(&a, &b), &c);
            let right = merged(&a, &merged(&b, &c));
            prop_assert_eq!(left, right);
        }

        #[test]
        fn test_send_status_merge_is_associative(
            a in send_status(),
            b in send_status(),
            c in send_status(),
        ) {
            let left = merged(&merged(&a, &b), &c);
            let right = merged(&a, &merged(&b, &c));
            prop_assert_eq!(left, right);
        }

        #[test]
        fn test_counters_merge_is_commutative(
            a_total in 0u64..100,
            b_total in 0u64..100,
            a_added in 0u64..100,
            b_expunged in 0u64..100,
        ) {
            let a = CategoryCounters { total: a_total, added: a_added, ..Default::default() };
            let b = CategoryCounters { total: b_total, expunged: b_expunged, ..Default::default() };
            prop_assert_eq!(merged(&a, &b), merged(&b, &a));
        }
    }

    #[test]
    fn test_merge_keeps_highest_usn_per_guid() {
        let mut a = DownloadNotesStatus::new();
        a.processed_guids_and_usns.insert("g".to_string(), 10);
        let mut b = DownloadNotesStatus::new();
        b.processed_guids_and_usns.insert("g".to_string(), 7);
        b.processed_guids_and_usns.insert("h".to_string(), 3);

        a.merge(&b);

        assert_eq!(a.processed_guids_and_usns.get("g"), Some(&10));
        assert_eq!(a.processed_guids_and_usns.get("h"), Some(&3));
    }

    #[test]
    fn test_first_stop_error_wins() {
        let mut status = SendStatus::new();
        let mut other = SendStatus::new();
        other.stop_synchronization_error = Some(StopSynchronizationError::AuthenticationExpired);
        status.merge(&other);

        let mut later = SendStatus::new();
        later.stop_synchronization_error = Some(StopSynchronizationError::RateLimitReached {
            duration_secs: Some(5),
        });
        status.merge(&later);

        assert_eq!(
            status.stop_synchronization_error,
            Some(StopSynchronizationError::AuthenticationExpired)
        );
    }

    #[test]
    fn test_fold_into_counters() {
        let mut status = DownloadItemsStatus::<Tag>::new();
        status.total_new = 2;
        status.total_expunged = 1;
        status
            .failed_to_process
            .push(ItemFailure::new(Tag::default(), Error::local_store("boom")));

        let mut counters = CategoryCounters::default();
        let mut failed_items = Vec::new();
        let mut failed_expunges = Vec::new();
        status.fold_into(&mut counters, &mut failed_items, &mut failed_expunges);

        assert_eq!(counters.added, 2);
        assert_eq!(counters.expunged, 1);
        assert_eq!(counters.failed_to_process, 1);
        assert_eq!(failed_items.len(), 1);
        assert_eq!(failed_items[0].item.kind(), ItemKind::Tag);
        assert!(failed_expunges.is_empty());
    }

    #[test]
    fn test_counters_by_kind() {
        let mut counters = SyncChunksDataCounters::default();
        counters.counters_mut(ItemKind::Tag).unwrap().total = 4;

        assert_eq!(counters.counters(ItemKind::Tag).unwrap().total, 4);
        assert!(counters.counters(ItemKind::Note).is_none());
    }
}
