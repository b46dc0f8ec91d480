//! Configuration for the update pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdaterError};
use crate::ranges::RangeLimits;

/// Tunables for leases, flushing and range limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Lease TTL in seconds.
    pub lock_ttl_secs: u64,
    /// Maximum time to wait for a contended lease, in milliseconds.
    pub max_lock_wait_ms: u64,
    /// First retry backoff while waiting for a lease, in milliseconds.
    pub lock_retry_base_ms: u64,
    /// Backoff cap while waiting for a lease, in milliseconds.
    pub lock_retry_max_ms: u64,
    /// Age of unflushed changes after which read paths flush, in seconds.
    pub max_unflushed_age_secs: u64,
    /// Bound on a single durable-store write during flush, in milliseconds.
    pub flush_timeout_ms: u64,
    /// Maximum tracked changes per document.
    pub max_changes: usize,
    /// Maximum comments per document.
    pub max_comments: usize,
    /// Maximum size of the JSON-encoded document lines, in bytes.
    pub max_doc_length: usize,
    /// Maximum size of the JSON-encoded ranges, in bytes.
    pub max_ranges_size: usize,
    /// Number of applied updates retained per document for catch-up reads.
    pub doc_ops_max_length: usize,
    /// Maximum updates taken from the queue per drain cycle (`None` = all).
    pub max_updates_per_drain: Option<usize>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 30,
            max_lock_wait_ms: 10_000,
            lock_retry_base_ms: 50,
            lock_retry_max_ms: 1_000,
            max_unflushed_age_secs: 300,
            flush_timeout_ms: 5_000,
            max_changes: 2_000,
            max_comments: 500,
            max_doc_length: 2 * 1024 * 1024,
            max_ranges_size: 3 * 1024 * 1024,
            doc_ops_max_length: 100,
            max_updates_per_drain: None,
        }
    }
}

impl UpdaterConfig {
    /// Loads configuration from `QUIRE_*` environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or if the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_u64("QUIRE_LOCK_TTL_SECS")? {
            config.lock_ttl_secs = v;
        }
        if let Some(v) = env_u64("QUIRE_MAX_LOCK_WAIT_MS")? {
            config.max_lock_wait_ms = v;
        }
        if let Some(v) = env_u64("QUIRE_LOCK_RETRY_BASE_MS")? {
            config.lock_retry_base_ms = v;
        }
        if let Some(v) = env_u64("QUIRE_LOCK_RETRY_MAX_MS")? {
            config.lock_retry_max_ms = v;
        }
        if let Some(v) = env_u64("QUIRE_MAX_UNFLUSHED_AGE_SECS")? {
            config.max_unflushed_age_secs = v;
        }
        if let Some(v) = env_u64("QUIRE_FLUSH_TIMEOUT_MS")? {
            config.flush_timeout_ms = v;
        }
        if let Some(v) = env_usize("QUIRE_MAX_CHANGES")? {
            config.max_changes = v;
        }
        if let Some(v) = env_usize("QUIRE_MAX_COMMENTS")? {
            config.max_comments = v;
        }
        if let Some(v) = env_usize("QUIRE_MAX_DOC_LENGTH")? {
            config.max_doc_length = v;
        }
        if let Some(v) = env_usize("QUIRE_MAX_RANGES_SIZE")? {
            config.max_ranges_size = v;
        }
        if let Some(v) = env_usize("QUIRE_DOC_OPS_MAX_LENGTH")? {
            config.doc_ops_max_length = v;
        }
        config.max_updates_per_drain = env_usize("QUIRE_MAX_UPDATES_PER_DRAIN")?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.lock_ttl_secs == 0 {
            return Err(config_error("QUIRE_LOCK_TTL_SECS must be greater than zero"));
        }
        if self.lock_retry_base_ms == 0 || self.lock_retry_base_ms > self.lock_retry_max_ms {
            return Err(config_error(
                "QUIRE_LOCK_RETRY_BASE_MS must be non-zero and at most QUIRE_LOCK_RETRY_MAX_MS",
            ));
        }
        if self.flush_timeout_ms == 0 {
            return Err(config_error("QUIRE_FLUSH_TIMEOUT_MS must be greater than zero"));
        }
        if self.max_changes == 0 || self.max_comments == 0 {
            return Err(config_error(
                "QUIRE_MAX_CHANGES and QUIRE_MAX_COMMENTS must be greater than zero",
            ));
        }
        if self.max_doc_length == 0 || self.max_ranges_size == 0 {
            return Err(config_error(
                "QUIRE_MAX_DOC_LENGTH and QUIRE_MAX_RANGES_SIZE must be greater than zero",
            ));
        }
        if self.doc_ops_max_length == 0 {
            return Err(config_error("QUIRE_DOC_OPS_MAX_LENGTH must be greater than zero"));
        }
        if self.max_updates_per_drain == Some(0) {
            return Err(config_error("QUIRE_MAX_UPDATES_PER_DRAIN must be greater than zero"));
        }
        Ok(())
    }

    /// Lease TTL.
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Maximum wait for a contended lease.
    #[must_use]
    pub const fn max_lock_wait(&self) -> Duration {
        Duration::from_millis(self.max_lock_wait_ms)
    }

    /// First retry backoff while waiting for a lease.
    #[must_use]
    pub const fn lock_retry_base(&self) -> Duration {
        Duration::from_millis(self.lock_retry_base_ms)
    }

    /// Retry backoff cap while waiting for a lease.
    #[must_use]
    pub const fn lock_retry_max(&self) -> Duration {
        Duration::from_millis(self.lock_retry_max_ms)
    }

    /// Age of unflushed changes after which read paths flush.
    #[must_use]
    pub const fn max_unflushed_age(&self) -> Duration {
        Duration::from_secs(self.max_unflushed_age_secs)
    }

    /// Bound on a single durable-store write during flush.
    #[must_use]
    pub const fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Limits applied to tracked changes and comments.
    #[must_use]
    pub const fn range_limits(&self) -> RangeLimits {
        RangeLimits {
            max_changes: self.max_changes,
            max_comments: self.max_comments,
            max_ranges_size: self.max_ranges_size,
        }
    }
}

fn config_error(message: &str) -> UpdaterError {
    UpdaterError::Config {
        message: message.to_string(),
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>().map(Some).map_err(|e| UpdaterError::Config {
        message: format!("{name} must be a u64: {e}"),
    })
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>().map(Some).map_err(|e| UpdaterError::Config {
        message: format!("{name} must be a usize: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = UpdaterConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.lock_ttl(), Duration::from_secs(30));
        assert_eq!(config.max_lock_wait(), Duration::from_secs(10));
        assert_eq!(config.max_unflushed_age(), Duration::from_secs(300));
        assert_eq!(config.max_changes, 2_000);
        assert_eq!(config.max_comments, 500);
    }

    #[test]
    fn rejects_zero_drain_limit() {
        let config = UpdaterConfig {
            max_updates_per_drain: Some(0),
            ..UpdaterConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn rejects_inverted_backoff() {
        let config = UpdaterConfig {
            lock_retry_base_ms: 2_000,
            lock_retry_max_ms: 1_000,
            ..UpdaterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_partial_json_over_defaults() {
        let config: UpdaterConfig =
            serde_json::from_str(r#"{"max_changes": 10, "max_updates_per_drain": 5}"#)
                .expect("parse");
        assert_eq!(config.max_changes, 10);
        assert_eq!(config.max_updates_per_drain, Some(5));
        assert_eq!(config.max_comments, 500);
    }
}
