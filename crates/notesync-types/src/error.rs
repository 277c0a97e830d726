//! Error types and handling for notesync
//!
//! This module provides the error taxonomy shared by every synchronization
//! component. Per-item failures are carried as values inside status objects,
//! while rate limiting and authentication expiry are surfaced through
//! [`Error::stop_synchronization_error`] so callers can halt the whole run.

use crate::status::StopSynchronizationError;

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    /// Low severity - operation can continue
    Low,
    /// Medium severity - item should be retried on the next sync
    Medium,
    /// High severity - the current sync run should be aborted
    High,
    /// Critical severity - caller must intervene before syncing again
    Critical,
}

/// Main error type for notesync operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// Encoding or decoding of persisted data failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Local store operation failed
    #[error("Local store error: {message}")]
    LocalStore {
        /// Error message reported by the local store
        message: String,
    },

    /// Network error
    #[error("Network error: {message}")]
    Network {
        /// Error message describing the network issue
        message: String,
    },

    /// The remote service rejected the request
    #[error("Remote service error: {message}")]
    Remote {
        /// Error message reported by the remote service
        message: String,
    },

    /// The requested item does not exist
    #[error("Not found: {message}")]
    NotFound {
        /// Description of the missing item
        message: String,
    },

    /// The remote service reported a conflicting or stale update sequence number
    #[error("Data conflict: {message}")]
    Conflict {
        /// Description of the conflict
        message: String,
    },

    /// The remote service throttled the client
    #[error("Rate limit reached{}", match .duration_secs {
        Some(secs) => format!(", retry after {} seconds", secs),
        None => String::new(),
    })]
    RateLimitReached {
        /// Number of seconds to wait before the next request, if reported
        duration_secs: Option<u64>,
    },

    /// Authentication token expired
    #[error("Authentication expired")]
    AuthenticationExpired,

    /// The remote protocol version is not supported by this client
    #[error("Protocol version mismatch: {message}")]
    ProtocolVersion {
        /// Error message describing the mismatch
        message: String,
    },

    /// A caller violated an interface contract
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the violated contract
        message: String,
    },

    /// Synchronization error
    #[error("Synchronization error: {message}")]
    Sync {
        /// Error message describing the synchronization issue
        message: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O related errors
    Io,
    /// Serialization errors
    Serialization,
    /// Configuration errors
    Config,
    /// Local store errors
    LocalStore,
    /// Network and remote service errors
    Remote,
    /// Conflicting updates
    Conflict,
    /// Rate limiting or authentication expiry
    StopSynchronization,
    /// Contract violations
    Contract,
    /// Synchronization errors
    Sync,
    /// Cancellation
    Cancelled,
    /// Other errors
    Other,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::Config { .. } => ErrorKind::Config,
            Self::LocalStore { .. } => ErrorKind::LocalStore,
            Self::Network { .. } | Self::Remote { .. } | Self::NotFound { .. } => {
                ErrorKind::Remote
            }
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::RateLimitReached { .. } | Self::AuthenticationExpired => {
                ErrorKind::StopSynchronization
            }
            Self::ProtocolVersion { .. } | Self::InvalidArgument { .. } => ErrorKind::Contract,
            Self::Sync { .. } => ErrorKind::Sync,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Io { .. } => ErrorSeverity::Medium,
            Self::Serialization { .. } => ErrorSeverity::Medium,
            Self::Config { .. } => ErrorSeverity::High,
            Self::LocalStore { .. } => ErrorSeverity::Medium,
            Self::Network { .. } => ErrorSeverity::Medium,
            Self::Remote { .. } => ErrorSeverity::Medium,
            Self::NotFound { .. } => ErrorSeverity::Low,
            Self::Conflict { .. } => ErrorSeverity::Low,
            Self::RateLimitReached { .. } => ErrorSeverity::High,
            Self::AuthenticationExpired => ErrorSeverity::High,
            Self::ProtocolVersion { .. } => ErrorSeverity::Critical,
            Self::InvalidArgument { .. } => ErrorSeverity::Critical,
            Self::Sync { .. } => ErrorSeverity::Medium,
            Self::Cancelled => ErrorSeverity::Low,
            Self::Other { .. } => ErrorSeverity::Medium,
        }
    }

    /// Check if the failed operation can succeed on a later sync attempt
    /// without operator intervention
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. }
            | Self::Serialization { .. }
            | Self::LocalStore { .. }
            | Self::Network { .. }
            | Self::Remote { .. }
            | Self::NotFound { .. }
            | Self::Conflict { .. }
            | Self::RateLimitReached { .. }
            | Self::AuthenticationExpired
            | Self::Sync { .. }
            | Self::Other { .. } => true,
            Self::Config { .. }
            | Self::ProtocolVersion { .. }
            | Self::InvalidArgument { .. }
            | Self::Cancelled => false,
        }
    }

    /// Map this error to the condition that must halt the entire sync run,
    /// if it is one
    pub fn stop_synchronization_error(&self) -> Option<StopSynchronizationError> {
        match self {
            Self::RateLimitReached { duration_secs } => {
                Some(StopSynchronizationError::RateLimitReached {
                    duration_secs: *duration_secs,
                })
            }
            Self::AuthenticationExpired => Some(StopSynchronizationError::AuthenticationExpired),
            _ => None,
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new local store error
    pub fn local_store<S: Into<String>>(message: S) -> Self {
        Self::LocalStore {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new remote service error
    pub fn remote<S: Into<String>>(message: S) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create a new not found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a new data conflict error
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a new invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a new sync error
    pub fn sync<S: Into<String>>(message: S) -> Self {
        Self::Sync {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}

impl From<StopSynchronizationError> for Error {
    fn from(error: StopSynchronizationError) -> Self {
        match error {
            StopSynchronizationError::RateLimitReached { duration_secs } => {
                Self::RateLimitReached { duration_secs }
            }
            StopSynchronizationError::AuthenticationExpired => Self::AuthenticationExpired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_message_errors_never_stop_synchronization(message in ".*") {
            let errors = vec![
                Error::Io { message: message.clone() },
                Error::LocalStore { message: message.clone() },
                Error::Network { message: message.clone() },
                Error::Remote { message: message.clone() },
                Error::Conflict { message: message.clone() },
                Error::InvalidArgument { message: message.clone() },
                Error::Sync { message: message.clone() },
                Error::Other { message: message.clone() },
            ];

            for error in errors {
                prop_assert!(error.stop_synchronization_error().is_none());
                prop_assert!(error.kind() != ErrorKind::StopSynchronization);
            }
        }

        #[test]
        fn test_rate_limit_round_trips_through_stop_error(secs in proptest::option::of(0u64..86_400)) {
            let error = Error::RateLimitReached { duration_secs: secs };
            let stop = error.stop_synchronization_error();

            prop_assert_eq!(
                stop,
                Some(StopSynchronizationError::RateLimitReached { duration_secs: secs })
            );
            prop_assert_eq!(Error::from(stop.unwrap()), error);
        }
    }

    #[test]
    fn test_error_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "pending journal");
        let error = Error::from(io_error);

        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(error.is_recoverable());
        assert!(error.to_string().contains("pending journal"));
    }

    #[test]
    fn test_authentication_expired_stops_synchronization() {
        let error = Error::AuthenticationExpired;

        assert_eq!(error.kind(), ErrorKind::StopSynchronization);
        assert_eq!(error.severity(), ErrorSeverity::High);
        assert_eq!(
            error.stop_synchronization_error(),
            Some(StopSynchronizationError::AuthenticationExpired)
        );
    }

    #[test]
    fn test_contract_errors_are_not_recoverable() {
        let error = Error::invalid_argument("theirs has no guid");

        assert_eq!(error.kind(), ErrorKind::Contract);
        assert_eq!(error.severity(), ErrorSeverity::Critical);
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_rate_limit_display() {
        let error = Error::RateLimitReached {
            duration_secs: Some(30),
        };
        assert_eq!(error.to_string(), "Rate limit reached, retry after 30 seconds");

        let error = Error::RateLimitReached { duration_secs: None };
        assert_eq!(error.to_string(), "Rate limit reached");
    }
}
