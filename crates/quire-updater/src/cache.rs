//! Shared document cache gateway.
//!
//! The cache holds the working copy of every open document: lines, version,
//! ranges, a bounded window of recently applied updates, and the queue of
//! updates waiting to be applied. Writes are only issued by the holder of the
//! document's lease; the gateway itself still rejects writes whose version
//! does not line up with the applied updates, so a writer that lost its lease
//! cannot silently overwrite newer state.
//!
//! Each stored snapshot carries a SHA-256 hash of its lines that is verified
//! on every read.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use quire_core::{DocId, ProjectId};

use crate::error::{Result, UpdaterError};
use crate::op::Update;
use crate::ranges::RangeSet;

/// Working copy of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedDoc {
    /// Owning project.
    pub project_id: Option<ProjectId>,
    /// Document lines.
    pub lines: Vec<String>,
    /// Current version.
    pub version: u64,
    /// Tracked changes and comments.
    pub ranges: RangeSet,
    /// Document path within the project.
    pub pathname: Option<String>,
    /// History id of the document.
    pub history_id: Option<String>,
    /// First time the cached copy diverged from the durable store.
    pub unflushed_time: Option<DateTime<Utc>>,
    /// Time of the last update.
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Author of the last update.
    pub last_updated_by: Option<String>,
}

/// A write of an applied update to the cache.
#[derive(Debug, Clone, Copy)]
pub struct DocWrite<'a> {
    /// Lines after the update.
    pub lines: &'a [String],
    /// Version after the update.
    pub version: u64,
    /// Updates applied since the cached version; empty for a no-op update.
    pub applied: &'a [Update],
    /// Ranges after the update.
    pub ranges: &'a RangeSet,
    /// Author of the update.
    pub updated_by: Option<&'a str>,
}

/// Contract of the shared cache.
#[async_trait]
pub trait DocumentCache: Send + Sync + 'static {
    /// Reads the cached copy, if loaded.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::NotFound`] if the document is cached for a
    /// different project, and [`UpdaterError::ConsistencyViolation`] if the
    /// stored lines fail hash verification.
    async fn get_doc(&self, project_id: &ProjectId, doc_id: &DocId) -> Result<Option<CachedDoc>>;

    /// Seeds the cache with a document loaded from the durable store.
    async fn put_doc_in_memory(&self, doc_id: &DocId, doc: CachedDoc) -> Result<()>;

    /// Evicts a document, along with its retained updates.
    async fn remove_doc_from_memory(&self, project_id: &ProjectId, doc_id: &DocId) -> Result<()>;

    /// Stores the result of applying updates.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::NotFound`] if the document is not cached and
    /// [`UpdaterError::ConsistencyViolation`] if `write.version` is not the
    /// cached version plus the number of applied updates.
    async fn update_document(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        write: DocWrite<'_>,
    ) -> Result<()>;

    /// Returns retained updates applied at versions `[start, end)`; `end`
    /// defaults to the current version.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::OpsUnavailable`] if part of the range has been trimmed.
    async fn get_previous_ops(&self, doc_id: &DocId, start: u64, end: Option<u64>)
    -> Result<Vec<Update>>;

    /// Marks the cached copy as flushed.
    async fn clear_unflushed_time(&self, doc_id: &DocId) -> Result<()>;

    /// Changes the path of a cached document.
    ///
    /// Returns `false` when the document is not cached.
    async fn set_pathname(&self, doc_id: &DocId, pathname: &str) -> Result<bool>;

    /// Appends an update to the document's pending queue.
    async fn enqueue_update(&self, doc_id: &DocId, update: Update) -> Result<()>;

    /// Pops up to `limit` queued updates (all when `None`), oldest first.
    async fn take_pending_updates(&self, doc_id: &DocId, limit: Option<usize>)
    -> Result<Vec<Update>>;

    /// Number of queued updates.
    async fn pending_len(&self, doc_id: &DocId) -> Result<usize>;
}

/// Hex-encoded SHA-256 of the document lines, as stored alongside them.
#[must_use]
pub fn lines_hash(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(crate::text::join_lines(lines).as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
struct Entry {
    doc: CachedDoc,
    hash: String,
    ops: VecDeque<Update>,
}

/// In-process [`DocumentCache`].
///
/// Suitable for tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryDocumentCache {
    docs: Mutex<HashMap<DocId, Entry>>,
    queues: Mutex<HashMap<DocId, VecDeque<Update>>>,
    doc_ops_max_length: usize,
    fail_updates: AtomicBool,
}

impl Default for MemoryDocumentCache {
    fn default() -> Self {
        Self::new(100)
    }
}

fn poison_err<T>(_: PoisonError<T>) -> UpdaterError {
    UpdaterError::from(quire_core::Error::poisoned())
}

impl MemoryDocumentCache {
    /// Creates an empty cache retaining up to `doc_ops_max_length` updates per document.
    #[must_use]
    pub fn new(doc_ops_max_length: usize) -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            doc_ops_max_length,
            fail_updates: AtomicBool::new(false),
        }
    }

    /// Makes subsequent [`DocumentCache::update_document`] calls fail.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Number of cached documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.docs.lock().map_err(poison_err)?.len())
    }

    /// Whether no documents are cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl DocumentCache for MemoryDocumentCache {
    async fn get_doc(&self, project_id: &ProjectId, doc_id: &DocId) -> Result<Option<CachedDoc>> {
        let docs = self.docs.lock().map_err(poison_err)?;
        let Some(entry) = docs.get(doc_id) else {
            return Ok(None);
        };

        if entry.doc.project_id.as_ref().is_some_and(|p| p != project_id) {
            return Err(UpdaterError::not_found(format!(
                "{doc_id} (project id mismatch)"
            )));
        }

        let computed = lines_hash(&entry.doc.lines);
        if computed != entry.hash {
            return Err(UpdaterError::consistency(format!(
                "hash mismatch on cached lines of {doc_id}: stored {}, computed {computed}",
                entry.hash
            )));
        }

        Ok(Some(entry.doc.clone()))
    }

    async fn put_doc_in_memory(&self, doc_id: &DocId, doc: CachedDoc) -> Result<()> {
        let hash = lines_hash(&doc.lines);
        self.docs.lock().map_err(poison_err)?.insert(
            doc_id.clone(),
            Entry {
                doc,
                hash,
                ops: VecDeque::new(),
            },
        );
        Ok(())
    }

    async fn remove_doc_from_memory(&self, _project_id: &ProjectId, doc_id: &DocId) -> Result<()> {
        self.docs.lock().map_err(poison_err)?.remove(doc_id);
        Ok(())
    }

    async fn update_document(
        &self,
        _project_id: &ProjectId,
        doc_id: &DocId,
        write: DocWrite<'_>,
    ) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(UpdaterError::from(quire_core::Error::storage(format!(
                "injected cache write failure for {doc_id}"
            ))));
        }

        let mut docs = self.docs.lock().map_err(poison_err)?;
        let entry = docs
            .get_mut(doc_id)
            .ok_or_else(|| UpdaterError::not_found(doc_id))?;

        let expected = entry.doc.version + write.applied.len() as u64;
        if write.version != expected {
            return Err(UpdaterError::consistency(format!(
                "version mismatch for {doc_id}: cached {}, applied {}, new {}",
                entry.doc.version,
                write.applied.len(),
                write.version
            )));
        }

        let now = Utc::now();
        entry.hash = lines_hash(write.lines);
        entry.doc.lines = write.lines.to_vec();
        entry.doc.version = write.version;
        entry.doc.ranges = write.ranges.clone();
        entry.doc.last_updated_at = Some(now);
        entry.doc.last_updated_by = write.updated_by.map(str::to_string);

        if !write.applied.is_empty() {
            entry.ops.extend(write.applied.iter().cloned());
            while entry.ops.len() > self.doc_ops_max_length {
                entry.ops.pop_front();
            }
            if entry.doc.unflushed_time.is_none() {
                entry.doc.unflushed_time = Some(now);
            }
        }
        Ok(())
    }

    async fn get_previous_ops(
        &self,
        doc_id: &DocId,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<Update>> {
        let docs = self.docs.lock().map_err(poison_err)?;
        let entry = docs
            .get(doc_id)
            .ok_or_else(|| UpdaterError::not_found(doc_id))?;

        let version = entry.doc.version;
        let first_available = version.saturating_sub(entry.ops.len() as u64);
        let end = end.unwrap_or(version);
        if start < first_available || end > version {
            return Err(UpdaterError::OpsUnavailable {
                doc_id: doc_id.to_string(),
                requested: start,
                first_available,
            });
        }

        Ok(entry
            .ops
            .iter()
            .filter(|update| update.v >= start && update.v < end)
            .cloned()
            .collect())
    }

    async fn clear_unflushed_time(&self, doc_id: &DocId) -> Result<()> {
        if let Some(entry) = self.docs.lock().map_err(poison_err)?.get_mut(doc_id) {
            entry.doc.unflushed_time = None;
        }
        Ok(())
    }

    async fn set_pathname(&self, doc_id: &DocId, pathname: &str) -> Result<bool> {
        let mut docs = self.docs.lock().map_err(poison_err)?;
        let Some(entry) = docs.get_mut(doc_id) else {
            return Ok(false);
        };
        entry.doc.pathname = Some(pathname.to_string());
        Ok(true)
    }

    async fn enqueue_update(&self, doc_id: &DocId, update: Update) -> Result<()> {
        self.queues
            .lock()
            .map_err(poison_err)?
            .entry(doc_id.clone())
            .or_default()
            .push_back(update);
        Ok(())
    }

    async fn take_pending_updates(
        &self,
        doc_id: &DocId,
        limit: Option<usize>,
    ) -> Result<Vec<Update>> {
        let mut queues = self.queues.lock().map_err(poison_err)?;
        let Some(queue) = queues.get_mut(doc_id) else {
            return Ok(Vec::new());
        };
        let count = limit.map_or(queue.len(), |limit| limit.min(queue.len()));
        let taken: Vec<Update> = queue.drain(..count).collect();
        if queue.is_empty() {
            queues.remove(doc_id);
        }
        Ok(taken)
    }

    async fn pending_len(&self, doc_id: &DocId) -> Result<usize> {
        Ok(self
            .queues
            .lock()
            .map_err(poison_err)?
            .get(doc_id)
            .map_or(0, VecDeque::len))
    }
}
