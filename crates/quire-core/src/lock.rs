//! Distributed per-document lease lock.
//!
//! Every mutation of a document's cached state happens while holding that
//! document's lease. Leases are records in the shared [`StorageBackend`]:
//! - **CAS (Compare-and-Swap)**: Acquisition is a preconditioned write
//! - **TTL (Time-to-Live)**: A crashed holder blocks a document for at most one TTL
//! - **Token-checked release**: Releasing only touches the record if it is
//!   still the one written by this holder
//!
//! # How It Works
//!
//! 1. Acquisition writes `locks/docs/{doc_id}.lock.json` with a fresh token
//!    and an expiry, using the `DoesNotExist` precondition
//! 2. If a record exists and has expired, it is taken over with a
//!    `MatchesVersion` write bound to the version that was inspected
//! 3. Release overwrites the record with an already-expired copy, again
//!    conditioned on the version written at acquisition. A holder whose lease
//!    expired and was reassigned therefore never touches the new holder's record
//!
//! # Example
//!
//! ```rust,ignore
//! let locks = DocLockManager::new(storage.clone());
//!
//! let guard = locks.acquire(&doc_id, Duration::from_secs(10)).await?;
//! // ... mutate the document ...
//! guard.release().await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::id::DocId;
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Default lease TTL (30 seconds).
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Default maximum time a caller waits for a contended lease.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Base backoff between acquisition attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Maximum backoff between acquisition attempts.
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Lease record as stored in the coordination store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Token identifying the holder of this lease.
    pub token: String,

    /// When the lease expires.
    pub expires_at: DateTime<Utc>,

    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Incremented on every acquisition of the document's lease.
    #[serde(default)]
    pub sequence_number: u64,

    /// Optional description of the operation holding the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LeaseRecord {
    /// Creates a record for a new holder.
    #[must_use]
    pub fn new(token: impl Into<String>, ttl: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            token: token.into(),
            expires_at: now + chrono_duration(ttl),
            acquired_at: now,
            sequence_number,
            operation: None,
        }
    }

    /// Returns whether this lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns the remaining TTL, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        remaining(self.expires_at)
    }
}

/// A lease held on one document.
///
/// This is the data half of a [`LeaseGuard`]; it can be cloned and handed to
/// [`DocLockManager::release`] any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    doc_id: DocId,
    token: String,
    expires_at: DateTime<Utc>,
    version: String,
    sequence_number: u64,
}

impl Lease {
    /// Document this lease covers.
    #[must_use]
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// Holder token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Local view of when the lease expires.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Monotonic fencing token; a later holder always has a larger value.
    #[must_use]
    pub fn fencing_token(&self) -> u64 {
        self.sequence_number
    }

    /// Returns whether the lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns the remaining TTL, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        remaining(self.expires_at)
    }
}

/// Issues and releases per-document leases.
#[derive(Clone)]
pub struct DocLockManager {
    storage: Arc<dyn StorageBackend>,
    ttl: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl std::fmt::Debug for DocLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocLockManager")
            .field("ttl", &self.ttl)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .finish_non_exhaustive()
    }
}

impl DocLockManager {
    /// Creates a lock manager with the default TTL and backoff.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            ttl: DEFAULT_LEASE_TTL,
            backoff_base: BACKOFF_BASE,
            backoff_max: BACKOFF_MAX,
        }
    }

    /// Sets the lease TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the retry backoff used while waiting for a contended lease.
    #[must_use]
    pub const fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Returns the configured lease TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Storage path of a document's lease record.
    #[must_use]
    pub fn lock_path(doc_id: &DocId) -> String {
        format!("{}{doc_id}.lock.json", paths::DOC_LOCK_PREFIX)
    }

    /// Acquires the document's lease, waiting at most `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lease is still held by someone
    /// else when `max_wait` elapses, or a storage error.
    pub async fn acquire(&self, doc_id: &DocId, max_wait: Duration) -> Result<LeaseGuard> {
        self.acquire_with_operation(doc_id, max_wait, None).await
    }

    /// Acquires the document's lease, recording the operation in the record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lease could not be acquired in
    /// time, or a storage error.
    pub async fn acquire_with_operation(
        &self,
        doc_id: &DocId,
        max_wait: Duration,
        operation: Option<&str>,
    ) -> Result<LeaseGuard> {
        let started = Instant::now();
        let mut backoff = self.backoff_base;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.try_acquire_inner(doc_id, operation).await {
                Ok(lease) => {
                    tracing::debug!(
                        doc_id = %doc_id,
                        attempts,
                        waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "acquired document lease"
                    );
                    return Ok(self.guard(lease));
                }
                Err(LockError::AlreadyHeld(holder)) => {
                    let elapsed = started.elapsed();
                    if elapsed >= max_wait {
                        tracing::warn!(
                            doc_id = %doc_id,
                            holder = %holder,
                            attempts,
                            "timed out waiting for document lease"
                        );
                        return Err(Error::LockTimeout {
                            resource: doc_id.to_string(),
                            waited: elapsed,
                        });
                    }

                    let jitter = Duration::from_millis(rand_jitter());
                    let delay = (backoff.min(self.backoff_max) + jitter).min(max_wait - elapsed);
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(LockError::Storage(e)) => return Err(e),
            }
        }
    }

    /// Makes a single, non-blocking attempt to acquire the lease.
    ///
    /// Returns `Ok(None)` when a live holder owns the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination store fails.
    pub async fn try_acquire(&self, doc_id: &DocId) -> Result<Option<LeaseGuard>> {
        match self.try_acquire_inner(doc_id, None).await {
            Ok(lease) => Ok(Some(self.guard(lease))),
            Err(LockError::AlreadyHeld(_)) => Ok(None),
            Err(LockError::Storage(e)) => Err(e),
        }
    }

    fn guard(&self, lease: Lease) -> LeaseGuard {
        LeaseGuard {
            manager: self.clone(),
            lease,
            released: false,
        }
    }

    async fn try_acquire_inner(
        &self,
        doc_id: &DocId,
        operation: Option<&str>,
    ) -> std::result::Result<Lease, LockError> {
        let path = Self::lock_path(doc_id);
        let token = Ulid::new().to_string();

        // New records start with sequence_number = 1
        let mut record = LeaseRecord::new(&token, self.ttl, 1);
        record.operation = operation.map(str::to_string);

        match self
            .storage
            .put(&path, encode(&record).map_err(LockError::Storage)?, WritePrecondition::DoesNotExist)
            .await
            .map_err(LockError::Storage)?
        {
            WriteResult::Success { version } => {
                return Ok(lease_from(doc_id, &record, version));
            }
            WriteResult::PreconditionFailed { .. } => {
                // Record exists - check if expired
            }
        }

        // Take the version FIRST, then read contents, so the expiry decision is
        // bound to the version used for the takeover CAS.
        let Some(meta) = self.storage.head(&path).await.map_err(LockError::Storage)? else {
            return Err(LockError::AlreadyHeld("race".into()));
        };

        match self.read_record(doc_id).await.map_err(LockError::Storage)? {
            Some(existing) if existing.is_expired() => {
                let mut takeover =
                    LeaseRecord::new(&token, self.ttl, existing.sequence_number.saturating_add(1));
                takeover.operation = operation.map(str::to_string);

                match self
                    .storage
                    .put(
                        &path,
                        encode(&takeover).map_err(LockError::Storage)?,
                        WritePrecondition::MatchesVersion(meta.version),
                    )
                    .await
                    .map_err(LockError::Storage)?
                {
                    WriteResult::Success { version } => Ok(lease_from(doc_id, &takeover, version)),
                    WriteResult::PreconditionFailed { .. } => {
                        Err(LockError::AlreadyHeld("unknown".into()))
                    }
                }
            }
            Some(existing) => Err(LockError::AlreadyHeld(existing.token)),
            None => Err(LockError::AlreadyHeld("race".into())),
        }
    }

    /// Releases a lease.
    ///
    /// Idempotent: releasing twice, releasing after expiry, or releasing a
    /// lease that has since been taken over by another holder is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error only if the coordination store fails.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let path = Self::lock_path(&lease.doc_id);

        let Some(meta) = self.storage.head(&path).await? else {
            return Ok(());
        };
        if meta.version != lease.version {
            // Already released, or reassigned after expiry.
            return Ok(());
        }

        let Some(current) = self.read_record(&lease.doc_id).await? else {
            return Ok(());
        };
        if current.token != lease.token {
            return Ok(());
        }

        // Leave an expired record behind rather than deleting: the sequence
        // number must survive for the next holder's fencing token.
        let expired = LeaseRecord {
            token: current.token,
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            acquired_at: current.acquired_at,
            sequence_number: current.sequence_number,
            operation: None,
        };

        match self
            .storage
            .put(
                &path,
                encode(&expired)?,
                WritePrecondition::MatchesVersion(lease.version.clone()),
            )
            .await?
        {
            WriteResult::Success { .. } => {
                tracing::debug!(doc_id = %lease.doc_id, "released document lease");
            }
            WriteResult::PreconditionFailed { .. } => {
                tracing::debug!(doc_id = %lease.doc_id, "lease changed hands before release");
            }
        }
        Ok(())
    }

    /// Checks whether a live lease exists for the document.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease state could not be read.
    pub async fn is_locked(&self, doc_id: &DocId) -> Result<bool> {
        Ok(self
            .read_record(doc_id)
            .await?
            .is_some_and(|record| !record.is_expired()))
    }

    /// Reads the current lease record without acquiring it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease state could not be read.
    pub async fn read_record(&self, doc_id: &DocId) -> Result<Option<LeaseRecord>> {
        match self.storage.get(&Self::lock_path(doc_id)).await {
            Ok(data) => {
                let record: LeaseRecord =
                    serde_json::from_slice(&data).map_err(|e| Error::Serialization {
                        message: format!("parse lease: {e}"),
                    })?;
                Ok(Some(record))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// RAII guard for a held document lease.
///
/// Prefer calling [`LeaseGuard::release`]; dropping the guard releases on a
/// best-effort basis in the background (and relies on the TTL when no Tokio
/// runtime is available).
pub struct LeaseGuard {
    manager: DocLockManager,
    lease: Lease,
    released: bool,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish()
    }
}

impl LeaseGuard {
    /// The held lease.
    #[must_use]
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Document covered by the lease.
    #[must_use]
    pub fn doc_id(&self) -> &DocId {
        &self.lease.doc_id
    }

    /// Holder token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.lease.token
    }

    /// Fencing token of this acquisition.
    #[must_use]
    pub fn fencing_token(&self) -> u64 {
        self.lease.sequence_number
    }

    /// Returns whether the lease has expired locally.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.lease.is_expired()
    }

    /// Fails once the lease has expired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] when the lease TTL has passed.
    pub fn ensure_held(&self) -> Result<()> {
        if self.lease.is_expired() {
            return Err(Error::PreconditionFailed {
                message: format!("lease on {} expired at {}", self.lease.doc_id, self.lease.expires_at),
            });
        }
        Ok(())
    }

    /// Explicitly releases the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination store fails.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.lease).await
    }

    /// Extends the lease so it expires `additional` from now.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is no longer held by this guard.
    pub async fn extend(&mut self, additional: Duration) -> Result<()> {
        let path = DocLockManager::lock_path(&self.lease.doc_id);

        match self.manager.read_record(&self.lease.doc_id).await? {
            Some(record) if record.token == self.lease.token => {
                let mut renewed = record;
                renewed.expires_at = Utc::now() + chrono_duration(additional);

                match self
                    .manager
                    .storage
                    .put(
                        &path,
                        encode(&renewed)?,
                        WritePrecondition::MatchesVersion(self.lease.version.clone()),
                    )
                    .await?
                {
                    WriteResult::Success { version } => {
                        self.lease.version = version;
                        self.lease.expires_at = renewed.expires_at;
                        Ok(())
                    }
                    WriteResult::PreconditionFailed { .. } => Err(Error::PreconditionFailed {
                        message: "lease modified by another holder".into(),
                    }),
                }
            }
            Some(_) => Err(Error::PreconditionFailed {
                message: "lease held by different holder".into(),
            }),
            None => Err(Error::NotFound(path)),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // No runtime (e.g. during shutdown): the TTL cleans up.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let manager = self.manager.clone();
        let lease = self.lease.clone();
        handle.spawn(async move {
            if let Err(e) = manager.release(&lease).await {
                tracing::warn!(doc_id = %lease.doc_id, error = %e, "background lease release failed");
            }
        });
    }
}

/// Internal lock acquisition errors.
enum LockError {
    AlreadyHeld(String),
    Storage(Error),
}

fn lease_from(doc_id: &DocId, record: &LeaseRecord, version: String) -> Lease {
    Lease {
        doc_id: doc_id.clone(),
        token: record.token.clone(),
        expires_at: record.expires_at,
        version,
        sequence_number: record.sequence_number,
    }
}

fn encode(record: &LeaseRecord) -> Result<Bytes> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization {
            message: format!("serialize lease: {e}"),
        })
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::seconds(30))
}

fn remaining(expires_at: DateTime<Utc>) -> Duration {
    let millis = (expires_at - Utc::now()).num_milliseconds();
    if millis <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

/// Generates random jitter for backoff (0-20ms).
fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 20
}

/// Path constants for lease records.
pub mod paths {
    /// Prefix for per-document lease records.
    pub const DOC_LOCK_PREFIX: &str = "locks/docs/";
}
