//! Result type alias for notesync operations

use crate::Error;

/// Result type alias for notesync operations
pub type Result<T> = std::result::Result<T, Error>;
