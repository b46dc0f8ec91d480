//! Error types and result aliases for Quire.
//!
//! This module defines the shared error type used by the core primitives
//! (identifiers, storage, leases). Engine-level failures are layered on top
//! of it by `quire-updater`.

use std::time::Duration;

/// The result type used throughout `quire-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core Quire operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// A lease could not be acquired within the allotted wait.
    #[error("timed out after {waited:?} waiting for lock on {resource}")]
    LockTimeout {
        /// The locked resource (document id).
        resource: String,
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an internal error for a poisoned in-process lock.
    #[must_use]
    pub fn poisoned() -> Self {
        Self::Internal {
            message: "lock poisoned".into(),
        }
    }
}
