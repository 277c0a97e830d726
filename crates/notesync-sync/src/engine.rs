//! Account synchronization engine

use crate::context::SyncContext;
use crate::downloader::{DownloadResult, Downloader, ScopeDownloadResult};
use crate::expunger::StaleDataExpungeStatus;
use crate::progress::SyncPhase;
use crate::sender::Sender;
use crate::sync_state::LastSyncState;
use notesync_types::{
    AuthMode, Error, Guid, Merge, Result, SendStatus, StopSynchronizationError, UserStore,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Client name reported to the protocol version check
pub const CLIENT_NAME: &str = "notesync";

/// Major protocol version spoken by this client
pub const PROTOCOL_VERSION_MAJOR: u16 = 1;

/// Minor protocol version spoken by this client
pub const PROTOCOL_VERSION_MINOR: u16 = 28;

/// Synchronization result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Download of the user's own account
    pub user_account_download: ScopeDownloadResult,
    /// Downloads of linked notebooks
    pub linked_notebook_downloads: BTreeMap<Guid, ScopeDownloadResult>,
    /// Linked notebooks whose download failed
    pub linked_notebook_errors: BTreeMap<Guid, Error>,
    /// Cleanup of unused linked notebook tags
    pub unused_tags_expunge_status: StaleDataExpungeStatus,
    /// Upload of local changes
    pub send_status: SendStatus,
    /// Watermarks at the end of the run
    pub sync_state: LastSyncState,
    /// Set when the run was halted
    pub stop_synchronization_error: Option<StopSynchronizationError>,
    /// Additional download and send passes that were needed
    pub repeats: u32,
}

impl SyncResult {
    fn absorb_download(&mut self, download: &DownloadResult) {
        self.user_account_download
            .merge(&download.user_own_result);
        for (guid, result) in &download.linked_notebook_results {
            self.linked_notebook_downloads
                .entry(guid.clone())
                .or_default()
                .merge(result);
        }
        for (guid, error) in &download.linked_notebook_errors {
            self.linked_notebook_errors
                .insert(guid.clone(), error.clone());
        }
        self.unused_tags_expunge_status
            .merge(&download.unused_tags_expunge_status);
        self.sync_state = download.sync_state.clone();
        self.stop_synchronization_error
            .merge(&download.stop_synchronization_error());
    }
}

impl Merge for SyncResult {
    fn merge(&mut self, other: &Self) {
        self.user_account_download
            .merge(&other.user_account_download);
        for (guid, result) in &other.linked_notebook_downloads {
            self.linked_notebook_downloads
                .entry(guid.clone())
                .or_default()
                .merge(result);
        }
        for (guid, error) in &other.linked_notebook_errors {
            self.linked_notebook_errors
                .insert(guid.clone(), error.clone());
        }
        self.unused_tags_expunge_status
            .merge(&other.unused_tags_expunge_status);
        self.send_status.merge(&other.send_status);
        self.sync_state = other.sync_state.clone();
        // The later run decides whether the account is still halted.
        self.stop_synchronization_error = other.stop_synchronization_error;
        self.repeats += other.repeats;
    }
}

/// Runs download and send for one account until it is consistent
pub struct AccountSynchronizer {
    ctx: SyncContext,
    user_store: Arc<dyn UserStore>,
}

impl AccountSynchronizer {
    /// Create a synchronizer
    pub fn new(ctx: SyncContext, user_store: Arc<dyn UserStore>) -> Self {
        Self { ctx, user_store }
    }

    /// Perform synchronization.
    ///
    /// When cached credentials turn out to be expired the caches are
    /// dropped and the run is repeated once with fresh credentials.
    pub async fn synchronize(&self) -> Result<SyncResult> {
        info!(account = %self.ctx.account.name, "Starting sync");

        let first = self.run(AuthMode::Cache).await;
        let expired = match &first {
            Ok(result) => {
                result.stop_synchronization_error
                    == Some(StopSynchronizationError::AuthenticationExpired)
            }
            Err(Error::AuthenticationExpired) => true,
            Err(_) => false,
        };
        if !expired {
            return first;
        }

        warn!(account = %self.ctx.account.name, "Cached authentication expired, authenticating again");
        self.ctx.auth_provider.clear_user_cache(self.ctx.account.id);
        self.ctx.auth_provider.clear_all_caches();

        let retried = self.run(AuthMode::NoCache).await?;
        Ok(match first {
            Ok(mut result) => {
                result.merge(&retried);
                result
            }
            Err(_) => retried,
        })
    }

    async fn run(&self, auth_mode: AuthMode) -> Result<SyncResult> {
        let notifier = &self.ctx.notifier;

        // Phase 1: Authenticate
        notifier.set_phase(SyncPhase::Authenticating).await;
        let auth = self
            .ctx
            .auth_provider
            .authenticate_account(&self.ctx.account, auth_mode)
            .await?;
        let request_ctx = self.ctx.options.request_context(&auth.auth_token);

        // Phase 2: Check protocol version
        notifier.set_phase(SyncPhase::CheckingProtocolVersion).await;
        let supported = self
            .user_store
            .check_version(
                CLIENT_NAME,
                PROTOCOL_VERSION_MAJOR,
                PROTOCOL_VERSION_MINOR,
                &request_ctx,
            )
            .await?;
        if !supported {
            return Err(Error::ProtocolVersion {
                message: format!(
                    "remote service rejected protocol version {}.{}",
                    PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR
                ),
            });
        }
        let user = self.user_store.get_user(&request_ctx).await?;
        let limits = self
            .user_store
            .get_account_limits(user.service_level, &request_ctx)
            .await?;

        let downloader = Downloader::new(self.ctx.clone());
        let sender = Sender::new(self.ctx.clone());
        let mut result = SyncResult::default();

        // Phase 3: Download, then send, repeating while the account moved
        loop {
            if self.ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let download = downloader.download(&auth, auth_mode).await?;
            result.absorb_download(&download);
            if result.stop_synchronization_error.is_some() {
                break;
            }

            let send = sender.send(&auth, &limits).await?;
            result.send_status.merge(&send);
            result
                .stop_synchronization_error
                .merge(&send.stop_synchronization_error);
            if result.stop_synchronization_error.is_some() {
                break;
            }

            if !send.need_to_repeat_incremental_sync {
                break;
            }
            if result.repeats >= self.ctx.options.max_sync_repeats {
                warn!(
                    repeats = result.repeats,
                    "Account still changing after the maximum number of sync repeats"
                );
                break;
            }
            result.repeats += 1;
            info!(repeat = result.repeats, "Repeating incremental sync");
        }

        if let Some(stop) = result.stop_synchronization_error {
            warn!(?stop, "Sync stopped");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_takes_later_stop_state() {
        let mut first = SyncResult {
            stop_synchronization_error: Some(StopSynchronizationError::AuthenticationExpired),
            repeats: 1,
            ..Default::default()
        };
        first.send_status.total_attempted_to_send_notes = 2;

        let mut second = SyncResult::default();
        second.send_status.total_attempted_to_send_notes = 3;

        first.merge(&second);
        assert_eq!(first.stop_synchronization_error, None);
        assert_eq!(first.send_status.total_attempted_to_send_notes, 5);
        assert_eq!(first.repeats, 1);
    }

    #[test]
    fn test_download_stop_is_surfaced() {
        let mut download = DownloadResult::default();
        download.linked_notebook_results.insert(
            "ln-1".to_string(),
            ScopeDownloadResult {
                stop_synchronization_error: Some(StopSynchronizationError::RateLimitReached {
                    duration_secs: Some(60),
                }),
                ..Default::default()
            },
        );

        let mut result = SyncResult::default();
        result.absorb_download(&download);
        assert_eq!(
            result.stop_synchronization_error,
            Some(StopSynchronizationError::RateLimitReached {
                duration_secs: Some(60)
            })
        );
        assert!(result.linked_notebook_downloads.contains_key("ln-1"));
    }
}
