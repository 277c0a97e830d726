//! notesync Integration Testing Suite
//!
//! This crate provides in-memory stand-ins for the collaborators of the
//! synchronization engine (local store, remote note and user stores,
//! authentication) together with end-to-end scenario tests driving the
//! public `Synchronizer` API against them.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Concurrency testing utilities
///
/// This module provides a gauge recording how many remote calls were in
/// flight at the same time.
pub mod concurrency_utils;

/// Unified test utilities
///
/// This module provides the fakes, item builders and the harness shared by
/// all scenario tests.
pub mod test_utils;
