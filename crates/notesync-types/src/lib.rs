//! Core type system and error handling for notesync
//!
//! This crate provides the foundational types, error handling, and shared data structures
//! used throughout the notesync workspace. It includes:
//!
//! - **Error handling**: Error taxonomy with severity levels and stop-synchronization mapping
//! - **Core types**: Identifiers, the synchronizable items, sync chunks and account records
//! - **Statuses**: Mergeable accumulators of counters and per-item failures
//! - **Traits**: Async interfaces of the local store, remote stores and authentication
//! - **Configuration**: Type-safe request and concurrency settings with validation
//!
//! # Examples
//!
//! ```rust
//! use notesync_types::{DownloadNotesStatus, Merge, Result};
//!
//! fn combine(first: DownloadNotesStatus, second: &DownloadNotesStatus) -> Result<DownloadNotesStatus> {
//!     let mut status = first;
//!     status.merge(second);
//!     Ok(status)
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod result;
pub mod status;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{ConcurrencyLimit, RetryConfig, TimeoutConfig};
pub use error::{Error, ErrorKind, ErrorSeverity};
pub use result::Result;
pub use status::*;
pub use traits::*;
pub use types::*;
