//! On-disk layout of an account's synchronization state

use notesync_types::{Account, ItemKind, SyncScope};
use std::path::{Path, PathBuf};

/// Paths below `<root>/<account name>_<account id>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPaths {
    account_dir: PathBuf,
}

impl AccountPaths {
    /// Layout for one account below the persistence root
    pub fn new<P: AsRef<Path>>(root: P, account: &Account) -> Self {
        Self {
            account_dir: root.as_ref().join(account.persistence_dir_name()),
        }
    }

    /// The account directory itself
    pub fn account_dir(&self) -> &Path {
        &self.account_dir
    }

    /// Watermarks of every scope
    pub fn sync_state_file(&self) -> PathBuf {
        self.account_dir.join("sync_state.json")
    }

    /// Root of the cached sync chunks
    pub fn sync_chunks_root(&self) -> PathBuf {
        self.account_dir.join("sync_chunks")
    }

    /// Root of the pending-item journals
    pub fn last_sync_data_root(&self) -> PathBuf {
        self.account_dir.join("last_sync_data")
    }
}

/// Relative directory of a scope: `user_own` or `linked_notebooks/<guid>`
pub fn scope_dir(scope: &SyncScope) -> PathBuf {
    match scope {
        SyncScope::UserOwn => PathBuf::from("user_own"),
        SyncScope::LinkedNotebook(guid) => Path::new("linked_notebooks").join(guid),
    }
}

/// Journal file of one category within a scope directory
pub fn journal_file_name(kind: ItemKind) -> String {
    format!("{}.jsonl", kind.as_str())
}
