//! Shared fixtures for the update pipeline integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use quire_core::{DocId, DocLockManager, MemoryBackend, ProjectId};
use quire_updater::history::{MemoryHistoryRecorder, MemorySnapshotArchiver};
use quire_updater::persistence::{DocRecord, DocStore, StorageDocStore};
use quire_updater::{MemoryDocumentCache, Result, UpdateManager, UpdaterConfig, UpdaterError};

// ============================================================================
// FlakyDocStore - durable store with failure and latency injection
// ============================================================================

/// Durable store wrapper that can fail or stall writes.
#[derive(Debug)]
pub struct FlakyDocStore {
    inner: StorageDocStore,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl FlakyDocStore {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            inner: StorageDocStore::new(backend),
            fail_writes: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    /// Makes subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stalls subsequent writes for `delay` before performing them.
    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap();
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocStore for FlakyDocStore {
    async fn get_doc(&self, project_id: &ProjectId, doc_id: &DocId) -> Result<DocRecord> {
        self.inner.get_doc(project_id, doc_id).await
    }

    async fn set_doc(&self, project_id: &ProjectId, doc_id: &DocId, record: &DocRecord) -> Result<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(UpdaterError::from(quire_core::Error::storage(format!(
                "injected write failure for {doc_id}"
            ))));
        }
        self.inner.set_doc(project_id, doc_id, record).await
    }
}

// ============================================================================
// Harness
// ============================================================================

/// An update manager wired to in-memory collaborators, with one seeded document.
pub struct Harness {
    pub manager: UpdateManager,
    pub cache: Arc<MemoryDocumentCache>,
    pub store: Arc<FlakyDocStore>,
    pub history: Arc<MemoryHistoryRecorder>,
    pub archiver: Arc<MemorySnapshotArchiver>,
    pub locks: DocLockManager,
    pub project: ProjectId,
    pub doc: DocId,
}

impl Harness {
    /// Seeds `lines` at `version` and builds a manager with the default config.
    pub async fn new(lines: &[&str], version: u64) -> Self {
        Self::with_config(lines, version, UpdaterConfig::default()).await
    }

    /// Seeds `lines` at `version` and builds a manager with `config`.
    pub async fn with_config(lines: &[&str], version: u64, config: UpdaterConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(FlakyDocStore::new(backend.clone()));
        let cache = Arc::new(MemoryDocumentCache::new(config.doc_ops_max_length));
        let history = Arc::new(MemoryHistoryRecorder::new());
        let archiver = Arc::new(MemorySnapshotArchiver::new());
        let project = ProjectId::new("project-1").unwrap();
        let doc = DocId::new("doc-1").unwrap();

        store
            .set_doc(
                &project,
                &doc,
                &DocRecord {
                    lines: owned(lines),
                    version,
                    pathname: Some("/main.tex".into()),
                    history_id: Some("history-1".into()),
                    ..DocRecord::default()
                },
            )
            .await
            .unwrap();

        let locks = DocLockManager::new(backend);
        let manager = UpdateManager::new(
            locks.clone(),
            cache.clone(),
            store.clone(),
            history.clone(),
            archiver.clone(),
            &config,
        )
        .unwrap();

        Self {
            manager,
            cache,
            store,
            history,
            archiver,
            locks,
            project,
            doc,
        }
    }

    /// Current lines and version, read under the lease.
    pub async fn snapshot(&self) -> (Vec<String>, u64) {
        let doc = self.manager.get_doc_with_lock(&self.project, &self.doc).await.unwrap();
        (doc.lines, doc.version)
    }

    /// Whether anyone holds the document lease.
    pub async fn is_locked(&self) -> bool {
        self.locks.is_locked(&self.doc).await.unwrap()
    }
}

pub fn owned(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|s| (*s).to_string()).collect()
}
