//! History and snapshot collaborators.
//!
//! Every persisted update is handed to a [`HistoryRecorder`] so that the
//! project history can be rebuilt. Recording is fire-and-forget: a failure
//! is logged and counted but never fails the update.
//!
//! When an update reduces a tracked range to nothing, the pre-update
//! snapshot is handed to a [`SnapshotArchiver`] first, since the collapsed
//! range's original extent cannot be recovered from the ops alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quire_core::{DocId, ProjectId, StorageBackend, WritePrecondition};

use crate::error::{Result, UpdaterError};
use crate::op::Update;
use crate::ranges::RangeSet;
use crate::text;

/// Prefix for archived snapshots.
pub const SNAPSHOT_PREFIX: &str = "snapshots/";

/// Consumer of applied updates.
#[async_trait]
pub trait HistoryRecorder: Send + Sync + 'static {
    /// Records updates applied to a document, in order.
    async fn record_ops(&self, project_id: &ProjectId, doc_id: &DocId, updates: &[Update]) -> Result<()>;
}

/// Pre-update state of a document whose ranges collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    /// Owning project.
    pub project_id: ProjectId,
    /// Document.
    pub doc_id: DocId,
    /// Version before the update.
    pub version: u64,
    /// Document path within the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    /// Lines before the update.
    pub lines: Vec<String>,
    /// Ranges before the update.
    pub ranges: RangeSet,
    /// When the snapshot was taken.
    pub recorded_at: DateTime<Utc>,
}

/// Durable recorder of pre-update snapshots.
#[async_trait]
pub trait SnapshotArchiver: Send + Sync + 'static {
    /// Records a snapshot.
    async fn record_snapshot(&self, snapshot: SnapshotRecord) -> Result<()>;
}

/// Adds the metadata history needs to every update about to be recorded.
///
/// `doc_length` is the length of the document before the updates, in
/// characters, counting the newlines between lines.
pub(crate) fn add_history_metadata(
    updates: &mut [Update],
    pathname: Option<&str>,
    history_id: Option<&str>,
    lines_before: &[String],
) {
    let doc_length = text::doc_length(lines_before);
    for update in updates {
        update.meta.pathname = pathname.map(str::to_string);
        update.meta.doc_length = Some(doc_length);
        update.history_id = history_id.map(str::to_string);
    }
}

fn poison_err<T>(_: PoisonError<T>) -> UpdaterError {
    UpdaterError::from(quire_core::Error::poisoned())
}

fn injected(what: &str) -> UpdaterError {
    UpdaterError::from(quire_core::Error::storage(format!("injected {what} failure")))
}

/// Recorder that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHistoryRecorder;

#[async_trait]
impl HistoryRecorder for NoopHistoryRecorder {
    async fn record_ops(&self, _project_id: &ProjectId, _doc_id: &DocId, _updates: &[Update]) -> Result<()> {
        Ok(())
    }
}

/// In-memory [`HistoryRecorder`] with failure injection.
#[derive(Debug, Default)]
pub struct MemoryHistoryRecorder {
    recorded: Mutex<Vec<(DocId, Update)>>,
    fail: AtomicBool,
}

impl MemoryHistoryRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent recordings fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Updates recorded so far, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the recorder lock is poisoned.
    pub fn recorded(&self) -> Result<Vec<(DocId, Update)>> {
        Ok(self.recorded.lock().map_err(poison_err)?.clone())
    }
}

#[async_trait]
impl HistoryRecorder for MemoryHistoryRecorder {
    async fn record_ops(&self, _project_id: &ProjectId, doc_id: &DocId, updates: &[Update]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected("history"));
        }
        self.recorded
            .lock()
            .map_err(poison_err)?
            .extend(updates.iter().map(|u| (doc_id.clone(), u.clone())));
        Ok(())
    }
}

/// In-memory [`SnapshotArchiver`] with failure injection.
#[derive(Debug, Default)]
pub struct MemorySnapshotArchiver {
    snapshots: Mutex<Vec<SnapshotRecord>>,
    fail: AtomicBool,
}

impl MemorySnapshotArchiver {
    /// Creates an empty archiver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent snapshots fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Snapshots recorded so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the archiver lock is poisoned.
    pub fn snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        Ok(self.snapshots.lock().map_err(poison_err)?.clone())
    }
}

#[async_trait]
impl SnapshotArchiver for MemorySnapshotArchiver {
    async fn record_snapshot(&self, snapshot: SnapshotRecord) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected("snapshot"));
        }
        self.snapshots.lock().map_err(poison_err)?.push(snapshot);
        Ok(())
    }
}

/// [`SnapshotArchiver`] writing one JSON object per snapshot to a [`StorageBackend`]:
///
/// ```text
/// snapshots/{project_id}/{doc_id}/{version}.json
/// ```
#[derive(Clone)]
pub struct StorageSnapshotArchiver {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for StorageSnapshotArchiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSnapshotArchiver").finish_non_exhaustive()
    }
}

impl StorageSnapshotArchiver {
    /// Creates an archiver on the given backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Storage path of a snapshot.
    #[must_use]
    pub fn snapshot_path(project_id: &ProjectId, doc_id: &DocId, version: u64) -> String {
        format!("{SNAPSHOT_PREFIX}{project_id}/{doc_id}/{version}.json")
    }
}

#[async_trait]
impl SnapshotArchiver for StorageSnapshotArchiver {
    async fn record_snapshot(&self, snapshot: SnapshotRecord) -> Result<()> {
        let path = Self::snapshot_path(&snapshot.project_id, &snapshot.doc_id, snapshot.version);
        let data = Bytes::from(serde_json::to_vec(&snapshot)?);
        // Overwrites any snapshot left at this version by an earlier failed update.
        self.storage.put(&path, data, WritePrecondition::None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;
    use quire_core::MemoryBackend;

    fn doc() -> DocId {
        DocId::new("doc-1").expect("valid")
    }

    #[test]
    fn history_metadata_uses_length_before_update() {
        let lines: Vec<String> = ["some", "test", "data"].iter().map(|s| (*s).to_string()).collect();
        let mut updates = vec![Update::new(doc(), 3, vec![Op::insert(0, "x")])];
        add_history_metadata(&mut updates, Some("/a.tex"), Some("h1"), &lines);

        assert_eq!(updates[0].meta.doc_length, Some(14));
        assert_eq!(updates[0].meta.pathname.as_deref(), Some("/a.tex"));
        assert_eq!(updates[0].history_id.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn memory_recorder_can_fail() {
        let recorder = MemoryHistoryRecorder::new();
        let project = ProjectId::new("p").expect("valid");
        let update = Update::new(doc(), 0, vec![]);

        recorder.record_ops(&project, &doc(), &[update.clone()]).await.expect("record");
        recorder.set_fail(true);
        assert!(recorder.record_ops(&project, &doc(), &[update]).await.is_err());
        assert_eq!(recorder.recorded().expect("recorded").len(), 1);
    }

    #[tokio::test]
    async fn storage_archiver_writes_versioned_path() {
        let backend = Arc::new(MemoryBackend::new());
        let archiver = StorageSnapshotArchiver::new(backend.clone());
        let project = ProjectId::new("p").expect("valid");

        archiver
            .record_snapshot(SnapshotRecord {
                project_id: project,
                doc_id: doc(),
                version: 7,
                pathname: None,
                lines: vec!["abc".into()],
                ranges: RangeSet::default(),
                recorded_at: Utc::now(),
            })
            .await
            .expect("record");

        let stored = backend.get("snapshots/p/doc-1/7.json").await.expect("stored");
        let decoded: SnapshotRecord = serde_json::from_slice(&stored).expect("decode");
        assert_eq!(decoded.version, 7);
        assert_eq!(decoded.lines, vec!["abc".to_string()]);
    }
}
