//! Error types for the update pipeline.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for update pipeline operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors that can occur while applying updates to a document.
#[derive(Debug, Error)]
pub enum UpdaterError {
    /// The document has neither cached nor durable state.
    #[error("document not found: {doc_id}")]
    NotFound {
        /// Document that was requested.
        doc_id: String,
    },

    /// The update was authored against a different version than the current one.
    #[error("stale version: document is at {expected}, update is based on {actual}")]
    StaleVersion {
        /// Current document version.
        expected: u64,
        /// Base version carried by the update.
        actual: u64,
    },

    /// Document text, ranges or cached state disagree with each other.
    #[error("consistency violation: {message}")]
    ConsistencyViolation {
        /// What did not match.
        message: String,
    },

    /// Too many tracked changes or comments.
    #[error("too many {kind}: {count} exceeds limit of {limit}")]
    CapacityExceeded {
        /// `"changes"` or `"comments"`.
        kind: &'static str,
        /// Count after the update.
        count: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The document lease could not be acquired in time.
    #[error("timed out after {waited:?} waiting for lease on {doc_id}")]
    LockTimeout {
        /// Document whose lease was contended.
        doc_id: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A snapshot or history side effect failed after the update was persisted.
    #[error("recording failure: {message}")]
    RecordingFailure {
        /// Description of the failure.
        message: String,
    },

    /// An op cannot be applied to the document (e.g. inserts past the end).
    #[error("invalid op: {message}")]
    InvalidOp {
        /// Why the op was rejected.
        message: String,
    },

    /// Document lines or ranges are larger than the configured limit.
    #[error("{what} too large: {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// `"document"` or `"ranges"`.
        what: &'static str,
        /// Serialized size in bytes.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The lease guarding the document is no longer held by this worker.
    #[error("lease lost on {doc_id}: {message}")]
    LeaseLost {
        /// Document whose lease was lost.
        doc_id: String,
        /// What went wrong.
        message: String,
    },

    /// Requested op history is no longer retained in the cache.
    #[error("ops for {doc_id} from version {requested} unavailable (oldest retained: {first_available})")]
    OpsUnavailable {
        /// Document whose ops were requested.
        doc_id: String,
        /// First version requested.
        requested: u64,
        /// Oldest version still retained.
        first_available: u64,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },

    /// Failure in the coordination or durable store.
    #[error("storage error: {source}")]
    Storage {
        /// The underlying core error.
        #[source]
        source: quire_core::Error,
    },
}

impl UpdaterError {
    /// Creates a consistency violation error.
    #[must_use]
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid op error.
    #[must_use]
    pub fn invalid_op(message: impl Into<String>) -> Self {
        Self::InvalidOp {
            message: message.into(),
        }
    }

    /// Creates a not found error for a document.
    #[must_use]
    pub fn not_found(doc_id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            doc_id: doc_id.to_string(),
        }
    }

    /// Stable, low-cardinality name of the error kind (metric label, log field).
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::StaleVersion { .. } => "stale_version",
            Self::ConsistencyViolation { .. } => "consistency_violation",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::RecordingFailure { .. } => "recording_failure",
            Self::InvalidOp { .. } => "invalid_op",
            Self::TooLarge { .. } => "too_large",
            Self::LeaseLost { .. } => "lease_lost",
            Self::OpsUnavailable { .. } => "ops_unavailable",
            Self::Config { .. } => "config",
            Self::Storage { .. } => "storage",
        }
    }

    /// Whether the caller may retry the whole operation later.
    ///
    /// The pipeline itself never retries.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::StaleVersion { .. } | Self::LeaseLost { .. }
        )
    }
}

impl From<quire_core::Error> for UpdaterError {
    fn from(error: quire_core::Error) -> Self {
        match error {
            quire_core::Error::LockTimeout { resource, waited } => Self::LockTimeout {
                doc_id: resource,
                waited,
            },
            source => Self::Storage { source },
        }
    }
}

impl From<serde_json::Error> for UpdaterError {
    fn from(error: serde_json::Error) -> Self {
        Self::Storage {
            source: quire_core::Error::Serialization {
                message: error.to_string(),
            },
        }
    }
}
