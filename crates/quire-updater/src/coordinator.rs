//! Per-document update coordinator.
//!
//! Updates for a document are queued in the cache and applied by whichever
//! worker holds the document's lease. A drain cycle runs as:
//!
//! 1. **Acquire** the lease (bounded wait; a timeout touches nothing)
//! 2. **Drain** the updates queued at that moment
//! 3. **Apply** each in order; the first failure aborts the rest of the batch
//! 4. **Release** the lease, on success and failure alike
//! 5. **Re-check** the queue and start a new cycle if it is non-empty
//!
//! Updates that arrive during a cycle are left for the next one, so a lease
//! is never held for more than one batch at a time.
//!
//! Read and maintenance operations come in two layers: a core operation on
//! [`DocumentManager`] that takes the held lease as a witness, and a
//! `*_with_lock` wrapper here that acquires the lease once, drains pending
//! updates, runs the core operation and releases. Wrappers never call other
//! wrappers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::Instrument;

use quire_core::{DocId, DocLockManager, LeaseGuard, ProjectId, doc_span};

use crate::applier::{AppliedUpdate, OperationApplier};
use crate::cache::{DocWrite, DocumentCache};
use crate::config::UpdaterConfig;
use crate::diff::diff_as_ops;
use crate::error::{Result, UpdaterError};
use crate::history::{HistoryRecorder, SnapshotArchiver, SnapshotRecord, add_history_metadata};
use crate::lifecycle::{DocumentManager, LoadedDoc, ensure_lease};
use crate::metrics;
use crate::op::Update;
use crate::persistence::DocStore;
use crate::ranges::RangeManager;

/// Update type recorded for whole-document replacements.
pub const EXTERNAL_UPDATE: &str = "external";

/// A whole-document replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDocRequest {
    /// New document lines.
    pub lines: Vec<String>,
    /// Where the replacement came from (for history).
    pub source: String,
    /// Author of the replacement.
    pub user_id: Option<String>,
    /// Whether the replacement undoes earlier edits.
    pub undoing: bool,
}

impl SetDocRequest {
    /// Creates a request with no author that is not an undo.
    #[must_use]
    pub fn new(lines: Vec<String>, source: impl Into<String>) -> Self {
        Self {
            lines,
            source: source.into(),
            user_id: None,
            undoing: false,
        }
    }

    /// Sets the author.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Marks the replacement as an undo.
    #[must_use]
    pub const fn undoing(mut self) -> Self {
        self.undoing = true;
        self
    }
}

/// Applies queued updates under the document lease and exposes locked
/// document operations.
#[derive(Clone)]
pub struct UpdateManager {
    locks: DocLockManager,
    cache: Arc<dyn DocumentCache>,
    documents: DocumentManager,
    applier: OperationApplier,
    ranges: RangeManager,
    history: Arc<dyn HistoryRecorder>,
    archiver: Arc<dyn SnapshotArchiver>,
    max_lock_wait: Duration,
    max_updates_per_drain: Option<usize>,
}

impl std::fmt::Debug for UpdateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateManager")
            .field("locks", &self.locks)
            .field("documents", &self.documents)
            .field("applier", &self.applier)
            .field("max_lock_wait", &self.max_lock_wait)
            .field("max_updates_per_drain", &self.max_updates_per_drain)
            .finish_non_exhaustive()
    }
}

impl UpdateManager {
    /// Creates a coordinator.
    ///
    /// The lock manager's TTL and backoff are taken from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::Config`] if `config` is invalid.
    pub fn new(
        locks: DocLockManager,
        cache: Arc<dyn DocumentCache>,
        store: Arc<dyn DocStore>,
        history: Arc<dyn HistoryRecorder>,
        archiver: Arc<dyn SnapshotArchiver>,
        config: &UpdaterConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            locks: locks
                .with_ttl(config.lock_ttl())
                .with_backoff(config.lock_retry_base(), config.lock_retry_max()),
            documents: DocumentManager::new(cache.clone(), store, config),
            cache,
            applier: OperationApplier::new(config.max_doc_length),
            ranges: RangeManager::new(config.range_limits()),
            history,
            archiver,
            max_lock_wait: config.max_lock_wait(),
            max_updates_per_drain: config.max_updates_per_drain,
        })
    }

    /// The lifecycle manager used by the core operations.
    #[must_use]
    pub fn documents(&self) -> &DocumentManager {
        &self.documents
    }

    // ========================================================================
    // Update queue
    // ========================================================================

    /// Queues an update and drains the document's queue under its lease.
    ///
    /// Another worker may already be draining; in that case this call waits
    /// for the lease and finds the update already applied. Errors from the
    /// batch this call drained are returned; errors from batches drained by
    /// other workers are reported to those workers.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`] if the lease could not be
    /// acquired, or the first error of a batch drained by this call.
    #[tracing::instrument(skip_all, fields(project_id = %project_id, doc_id = %doc_id, v = update.v))]
    pub async fn submit_update(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        update: Update,
    ) -> Result<usize> {
        if &update.doc != doc_id {
            return Err(UpdaterError::invalid_op(format!(
                "update for {} submitted to {doc_id}",
                update.doc
            )));
        }
        self.cache.enqueue_update(doc_id, update).await?;
        self.process_outstanding_updates_with_lock(project_id, doc_id).await
    }

    /// Runs drain cycles until the queue is empty, waiting for the lease as needed.
    ///
    /// Returns the number of updates applied.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`] if the lease could not be
    /// acquired, or the first error of a drained batch.
    #[tracing::instrument(skip_all, fields(project_id = %project_id, doc_id = %doc_id))]
    pub async fn process_outstanding_updates_with_lock(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
    ) -> Result<usize> {
        let mut total = 0;
        loop {
            let guard = self.acquire(doc_id, "process_updates").await?;
            let result = self.process_outstanding_updates(&guard, project_id, doc_id).await;
            total += release_after(guard, result).await?;

            if self.cache.pending_len(doc_id).await? == 0 {
                return Ok(total);
            }
        }
    }

    /// Like [`Self::process_outstanding_updates_with_lock`], but never waits
    /// for the lease.
    ///
    /// Returns `None` if another worker held the lease on the first attempt;
    /// that worker re-checks the queue after its cycle and picks the updates up.
    ///
    /// # Errors
    ///
    /// Returns the first error of a drained batch.
    #[tracing::instrument(skip_all, fields(project_id = %project_id, doc_id = %doc_id))]
    pub async fn try_process_outstanding_updates(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
    ) -> Result<Option<usize>> {
        let mut total = None;
        loop {
            let Some(guard) = self.locks.try_acquire(doc_id).await? else {
                tracing::debug!(%doc_id, "lease busy, leaving updates to current holder");
                return Ok(total);
            };
            let result = self.process_outstanding_updates(&guard, project_id, doc_id).await;
            let applied = release_after(guard, result).await?;
            total = Some(total.unwrap_or(0) + applied);

            if self.cache.pending_len(doc_id).await? == 0 {
                return Ok(total);
            }
        }
    }

    /// Drains one batch of queued updates under a held lease.
    ///
    /// # Errors
    ///
    /// Returns the first failing update's error; the rest of the batch is
    /// discarded.
    pub async fn process_outstanding_updates(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
    ) -> Result<usize> {
        ensure_lease(lease, doc_id)?;
        let updates = self
            .cache
            .take_pending_updates(doc_id, self.max_updates_per_drain)
            .await?;
        if updates.is_empty() {
            return Ok(0);
        }

        let batch = updates.len();
        metrics::record_drain_batch(batch);
        tracing::debug!(%doc_id, batch, "draining queued updates");

        for (index, update) in updates.into_iter().enumerate() {
            let v = update.v;
            if let Err(e) = self.apply_update(lease, project_id, doc_id, update).await {
                metrics::record_update_error(e.kind());
                tracing::warn!(
                    %project_id,
                    %doc_id,
                    v,
                    error = %e,
                    kind = e.kind(),
                    discarded = batch - index - 1,
                    "update failed, aborting drain batch"
                );
                return Err(e);
            }
        }
        Ok(batch)
    }

    /// Applies one update under a held lease and persists the result.
    ///
    /// The document is loaded, the update applied, the ranges patched and
    /// validated, and everything written to the cache in one step; nothing is
    /// written if any of those fail. If the update collapsed a range, the
    /// pre-update snapshot is archived. The update is then handed to history.
    ///
    /// Returns the document version after the update.
    ///
    /// # Errors
    ///
    /// - [`UpdaterError::NotFound`] if the document does not exist
    /// - [`UpdaterError::StaleVersion`] if the update is not based on the current version
    /// - [`UpdaterError::ConsistencyViolation`] if ops or ranges disagree with the text
    /// - [`UpdaterError::CapacityExceeded`] / [`UpdaterError::TooLarge`] on limits
    /// - [`UpdaterError::LeaseLost`] if the lease expired before the write
    /// - [`UpdaterError::RecordingFailure`] if archiving failed after the write
    pub async fn apply_update(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
        update: Update,
    ) -> Result<u64> {
        let doc = self.documents.get_doc(lease, project_id, doc_id).await?;
        let updated_by = update.meta.user_id.clone();

        let AppliedUpdate {
            lines,
            version,
            update: applied,
        } = self.applier.apply(&doc.lines, doc.version, update)?;
        let patch = self.ranges.apply_update(&doc.ranges, &applied, &lines)?;

        let op_count = applied.op.len();
        let mut applied = if applied.op.is_empty() {
            Vec::new()
        } else {
            vec![applied]
        };
        add_history_metadata(
            &mut applied,
            doc.pathname.as_deref(),
            doc.history_id.as_deref(),
            &doc.lines,
        );

        ensure_lease(lease, doc_id)?;
        self.cache
            .update_document(
                project_id,
                doc_id,
                DocWrite {
                    lines: &lines,
                    version,
                    applied: &applied,
                    ranges: &patch.ranges,
                    updated_by: updated_by.as_deref(),
                },
            )
            .await?;
        metrics::record_update_applied(op_count);
        tracing::debug!(%doc_id, version, op_count, "applied update");

        let archived = if patch.collapsed {
            metrics::record_ranges_collapsed();
            self.archive_snapshot(project_id, doc_id, doc).await
        } else {
            Ok(())
        };

        if !applied.is_empty() {
            if let Err(e) = self.history.record_ops(project_id, doc_id, &applied).await {
                metrics::record_history_failure();
                tracing::warn!(%project_id, %doc_id, version, error = %e, "error recording ops in history");
            }
        }

        archived?;
        Ok(version)
    }

    async fn archive_snapshot(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        before: LoadedDoc,
    ) -> Result<()> {
        let version = before.version;
        self.archiver
            .record_snapshot(SnapshotRecord {
                project_id: project_id.clone(),
                doc_id: doc_id.clone(),
                version,
                pathname: before.pathname,
                lines: before.lines,
                ranges: before.ranges,
                recorded_at: Utc::now(),
            })
            .await
            .map_err(|e| {
                tracing::error!(%project_id, %doc_id, version, error = %e, "failed to archive snapshot of collapsed ranges");
                UpdaterError::RecordingFailure {
                    message: format!("snapshot of {doc_id} at version {version}: {e}"),
                }
            })
    }

    /// Replaces the document's lines, recording the difference as an
    /// external update, and writes the result to the durable store.
    ///
    /// A document that was loaded just for this call is evicted again
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if applying the update or flushing fails.
    pub async fn set_doc(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
        request: SetDocRequest,
    ) -> Result<()> {
        let doc = self.documents.get_doc(lease, project_id, doc_id).await?;

        let mut ops = diff_as_ops(&doc.lines, &request.lines);
        if request.undoing {
            ops.iter_mut().for_each(crate::op::Op::mark_undo);
        }

        let mut update = Update::new(doc_id.clone(), doc.version, ops).with_source(request.source);
        update.meta.kind = Some(EXTERNAL_UPDATE.to_string());
        update.meta.user_id = request.user_id;

        self.apply_update(lease, project_id, doc_id, update).await?;

        if doc.already_loaded {
            self.documents.flush_doc_if_loaded(lease, project_id, doc_id).await?;
        } else {
            self.documents
                .flush_and_delete_doc(lease, project_id, doc_id, false)
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Locked wrappers
    // ========================================================================

    /// Loads the document under its lease.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`], or the error of the operation.
    pub async fn get_doc_with_lock(&self, project_id: &ProjectId, doc_id: &DocId) -> Result<LoadedDoc> {
        self.lock_updates_and_do(project_id, doc_id, "get_doc", |this, lease, project_id, doc_id| {
            async move { this.documents.get_doc(lease, project_id, doc_id).await }.boxed()
        })
        .await
    }

    /// Loads the document and the updates applied since `from_version` under its lease.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`], or the error of the operation.
    pub async fn get_doc_and_recent_ops_with_lock(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        from_version: Option<u64>,
    ) -> Result<(LoadedDoc, Vec<Update>)> {
        self.lock_updates_and_do(
            project_id,
            doc_id,
            "get_doc_and_recent_ops",
            move |this, lease, project_id, doc_id| {
                async move {
                    this.documents
                        .get_doc_and_recent_ops(lease, project_id, doc_id, from_version)
                        .await
                }
                .boxed()
            },
        )
        .await
    }

    /// Loads the document under its lease, flushing it if its unflushed
    /// changes are old.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`], or the error of the operation.
    pub async fn get_doc_and_flush_if_old_with_lock(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
    ) -> Result<LoadedDoc> {
        self.lock_updates_and_do(
            project_id,
            doc_id,
            "get_doc_and_flush_if_old",
            |this, lease, project_id, doc_id| {
                async move {
                    this.documents
                        .get_doc_and_flush_if_old(lease, project_id, doc_id)
                        .await
                }
                .boxed()
            },
        )
        .await
    }

    /// Replaces the document's lines under its lease.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`], or the error of the operation.
    pub async fn set_doc_with_lock(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        request: SetDocRequest,
    ) -> Result<()> {
        self.lock_updates_and_do(project_id, doc_id, "set_doc", move |this, lease, project_id, doc_id| {
            async move { this.set_doc(lease, project_id, doc_id, request).await }.boxed()
        })
        .await
    }

    /// Flushes the document to the durable store under its lease, if cached.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`], or the error of the operation.
    pub async fn flush_doc_if_loaded_with_lock(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
    ) -> Result<bool> {
        self.lock_updates_and_do(
            project_id,
            doc_id,
            "flush_doc_if_loaded",
            |this, lease, project_id, doc_id| {
                async move { this.documents.flush_doc_if_loaded(lease, project_id, doc_id).await }
                    .boxed()
            },
        )
        .await
    }

    /// Flushes and evicts the document under its lease.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`], or the error of the operation.
    pub async fn flush_and_delete_doc_with_lock(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        ignore_flush_errors: bool,
    ) -> Result<()> {
        self.lock_updates_and_do(
            project_id,
            doc_id,
            "flush_and_delete_doc",
            move |this, lease, project_id, doc_id| {
                async move {
                    this.documents
                        .flush_and_delete_doc(lease, project_id, doc_id, ignore_flush_errors)
                        .await
                }
                .boxed()
            },
        )
        .await
    }

    /// Accepts tracked changes under the document lease.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`], or the error of the operation.
    pub async fn accept_changes_with_lock(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        change_ids: &[String],
    ) -> Result<()> {
        let change_ids = change_ids.to_vec();
        self.lock_updates_and_do(
            project_id,
            doc_id,
            "accept_changes",
            move |this, lease, project_id, doc_id| {
                async move {
                    this.documents
                        .accept_changes(lease, project_id, doc_id, &change_ids)
                        .await
                }
                .boxed()
            },
        )
        .await
    }

    /// Deletes a comment under the document lease.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`], or the error of the operation.
    pub async fn delete_comment_with_lock(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        comment_id: &str,
    ) -> Result<()> {
        let comment_id = comment_id.to_string();
        self.lock_updates_and_do(
            project_id,
            doc_id,
            "delete_comment",
            move |this, lease, project_id, doc_id| {
                async move {
                    this.documents
                        .delete_comment(lease, project_id, doc_id, &comment_id)
                        .await
                }
                .boxed()
            },
        )
        .await
    }

    /// Changes the cached path of a document under the document lease.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::LockTimeout`], or the error of the operation.
    pub async fn rename_doc_with_lock(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        new_pathname: &str,
    ) -> Result<()> {
        let new_pathname = new_pathname.to_string();
        self.lock_updates_and_do(
            project_id,
            doc_id,
            "rename_doc",
            move |this, lease, project_id, doc_id| {
                async move {
                    this.documents
                        .rename_doc(lease, project_id, doc_id, &new_pathname)
                        .await
                }
                .boxed()
            },
        )
        .await
    }

    /// Acquires the lease once, drains pending updates, runs `operation`,
    /// releases, then processes anything queued in the meantime.
    async fn lock_updates_and_do<T, F>(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
        operation: &'static str,
        f: F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a Self, &'a LeaseGuard, &'a ProjectId, &'a DocId) -> BoxFuture<'a, Result<T>>
            + Send,
    {
        let span = doc_span(operation, project_id.as_str(), doc_id.as_str());
        async move {
            let guard = self.acquire(doc_id, operation).await?;

            let result = match self.process_outstanding_updates(&guard, project_id, doc_id).await {
                Ok(_) => f(self, &guard, project_id, doc_id).await,
                Err(e) => Err(e),
            };
            let value = release_after(guard, result).await?;

            // Failures here belong to other clients' updates, not to this caller.
            if let Err(e) = self.continue_processing_updates(project_id, doc_id).await {
                tracing::warn!(
                    %project_id,
                    %doc_id,
                    error = %e,
                    "failed to process updates queued during operation"
                );
            }
            Ok(value)
        }
        .instrument(span)
        .await
    }

    async fn continue_processing_updates(
        &self,
        project_id: &ProjectId,
        doc_id: &DocId,
    ) -> Result<()> {
        if self.cache.pending_len(doc_id).await? > 0 {
            self.process_outstanding_updates_with_lock(project_id, doc_id).await?;
        }
        Ok(())
    }

    async fn acquire(&self, doc_id: &DocId, operation: &'static str) -> Result<LeaseGuard> {
        let started = Instant::now();
        match self
            .locks
            .acquire_with_operation(doc_id, self.max_lock_wait, Some(operation))
            .await
        {
            Ok(guard) => {
                metrics::record_lock_wait(started.elapsed());
                Ok(guard)
            }
            Err(e) => {
                if matches!(e, quire_core::Error::LockTimeout { .. }) {
                    metrics::record_lock_timeout();
                }
                Err(e.into())
            }
        }
    }
}

/// Releases `guard`, then returns `result`; a release error is returned only
/// when `result` is `Ok`.
async fn release_after<T>(guard: LeaseGuard, result: Result<T>) -> Result<T> {
    let doc_id = guard.doc_id().clone();
    let released = guard.release().await;
    if let Err(e) = &released {
        tracing::warn!(%doc_id, error = %e, "failed to release document lease");
    }
    let value = result?;
    released?;
    Ok(value)
}
