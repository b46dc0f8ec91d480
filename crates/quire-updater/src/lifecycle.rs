//! Document lifecycle: load on miss, flush, evict.
//!
//! A document moves between three states:
//!
//! ```text
//! unloaded ──get_doc──▶ cached ──flush_and_delete_doc──▶ unloaded
//!                         │  ▲
//!                         └──┘ flush_doc_if_loaded
//! ```
//!
//! Every operation takes the document's [`LeaseGuard`] as a witness. The
//! manager never acquires leases itself; the coordinator's locked wrappers
//! do that once per call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use quire_core::{DocId, LeaseGuard, ProjectId};

use crate::cache::{CachedDoc, DocWrite, DocumentCache};
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::metrics;
use crate::op::Update;
use crate::persistence::{DocRecord, DocStore};
use crate::ranges::{RangeManager, RangeSet};

/// A document as returned by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDoc {
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
    /// Whether the document was already cached before this call.
    pub already_loaded: bool,
}

impl LoadedDoc {
    fn from_cached(doc: CachedDoc, already_loaded: bool) -> Self {
        Self {
            lines: doc.lines,
            version: doc.version,
            ranges: doc.ranges,
            pathname: doc.pathname,
            history_id: doc.history_id,
            unflushed_time: doc.unflushed_time,
            already_loaded,
        }
    }
}

/// Fails unless `lease` is a live lease on `doc_id`.
pub(crate) fn ensure_lease(lease: &LeaseGuard, doc_id: &DocId) -> Result<()> {
    if lease.doc_id() != doc_id {
        return Err(UpdaterError::LeaseLost {
            doc_id: doc_id.to_string(),
            message: format!("lease is for {}", lease.doc_id()),
        });
    }
    lease.ensure_held().map_err(|e| UpdaterError::LeaseLost {
        doc_id: doc_id.to_string(),
        message: e.to_string(),
    })
}

/// Moves documents between the durable store and the cache.
#[derive(Clone)]
pub struct DocumentManager {
    cache: Arc<dyn DocumentCache>,
    store: Arc<dyn DocStore>,
    ranges: RangeManager,
    flush_timeout: Duration,
    max_unflushed_age: Duration,
}

impl std::fmt::Debug for DocumentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentManager")
            .field("ranges", &self.ranges)
            .field("flush_timeout", &self.flush_timeout)
            .field("max_unflushed_age", &self.max_unflushed_age)
            .finish_non_exhaustive()
    }
}

impl DocumentManager {
    /// Creates a manager over the given cache and durable store.
    #[must_use]
    pub fn new(cache: Arc<dyn DocumentCache>, store: Arc<dyn DocStore>, config: &UpdaterConfig) -> Self {
        Self {
            cache,
            store,
            ranges: RangeManager::new(config.range_limits()),
            flush_timeout: config.flush_timeout(),
            max_unflushed_age: config.max_unflushed_age(),
        }
    }

    /// The cache this manager loads into.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn DocumentCache> {
        &self.cache
    }

    /// Returns the cached document, loading it from the durable store on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::NotFound`] if the document exists in neither
    /// the cache nor the durable store.
    pub async fn get_doc(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
    ) -> Result<LoadedDoc> {
        ensure_lease(lease, doc_id)?;

        if let Some(cached) = self.cache.get_doc(project_id, doc_id).await? {
            return Ok(LoadedDoc::from_cached(cached, true));
        }

        tracing::debug!(%project_id, %doc_id, "doc not in cache, loading from durable store");
        let record = self.store.get_doc(project_id, doc_id).await?;
        let cached = CachedDoc {
            project_id: Some(project_id.clone()),
            lines: record.lines,
            version: record.version,
            ranges: record.ranges,
            pathname: record.pathname,
            history_id: record.history_id,
            unflushed_time: None,
            last_updated_at: record.last_updated_at,
            last_updated_by: record.last_updated_by,
        };
        self.cache.put_doc_in_memory(doc_id, cached.clone()).await?;
        metrics::record_doc_loaded();

        Ok(LoadedDoc::from_cached(cached, false))
    }

    /// Returns the document plus the updates applied since `from_version`.
    ///
    /// `None` returns no ops.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::OpsUnavailable`] if the requested updates are
    /// no longer retained.
    pub async fn get_doc_and_recent_ops(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
        from_version: Option<u64>,
    ) -> Result<(LoadedDoc, Vec<Update>)> {
        let doc = self.get_doc(lease, project_id, doc_id).await?;
        let ops = match from_version {
            None => Vec::new(),
            Some(from) => {
                self.cache
                    .get_previous_ops(doc_id, from, Some(doc.version))
                    .await?
            }
        };
        Ok((doc, ops))
    }

    /// Returns the document, first flushing it if it was already loaded and
    /// has had unflushed changes for longer than the configured age.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or flushing fails.
    pub async fn get_doc_and_flush_if_old(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
    ) -> Result<LoadedDoc> {
        let doc = self.get_doc(lease, project_id, doc_id).await?;
        let is_old = doc.unflushed_time.is_some_and(|since| {
            (Utc::now() - since)
                .to_std()
                .is_ok_and(|age| age > self.max_unflushed_age)
        });

        if doc.already_loaded && is_old {
            tracing::info!(%project_id, %doc_id, "flushing old unflushed doc");
            self.flush_doc_if_loaded(lease, project_id, doc_id).await?;
        }
        Ok(doc)
    }

    /// Writes the cached copy to the durable store, if the document is cached.
    ///
    /// Returns whether a flush happened.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails or exceeds the flush timeout.
    pub async fn flush_doc_if_loaded(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
    ) -> Result<bool> {
        ensure_lease(lease, doc_id)?;

        let Some(cached) = self.cache.get_doc(project_id, doc_id).await? else {
            tracing::debug!(%project_id, %doc_id, "doc not in cache, not flushing");
            metrics::record_flush("skipped");
            return Ok(false);
        };

        let record = DocRecord {
            lines: cached.lines,
            version: cached.version,
            ranges: cached.ranges,
            pathname: cached.pathname,
            history_id: cached.history_id,
            last_updated_at: cached.last_updated_at,
            last_updated_by: cached.last_updated_by,
        };

        match tokio::time::timeout(
            self.flush_timeout,
            self.store.set_doc(project_id, doc_id, &record),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics::record_flush("error");
                return Err(e);
            }
            Err(_) => {
                metrics::record_flush("timeout");
                return Err(UpdaterError::from(quire_core::Error::storage(format!(
                    "flush of {doc_id} timed out after {:?}",
                    self.flush_timeout
                ))));
            }
        }

        self.cache.clear_unflushed_time(doc_id).await?;
        metrics::record_flush("ok");
        tracing::debug!(%project_id, %doc_id, version = record.version, "flushed doc");
        Ok(true)
    }

    /// Flushes the document and evicts it from the cache.
    ///
    /// With `ignore_flush_errors`, a failed flush is logged and the document
    /// is evicted anyway.
    ///
    /// # Errors
    ///
    /// Returns the flush error unless `ignore_flush_errors` is set, and any
    /// error evicting the document.
    pub async fn flush_and_delete_doc(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
        ignore_flush_errors: bool,
    ) -> Result<()> {
        if let Err(e) = self.flush_doc_if_loaded(lease, project_id, doc_id).await {
            if !ignore_flush_errors {
                return Err(e);
            }
            tracing::warn!(%project_id, %doc_id, error = %e, "ignoring flush error while deleting document");
        }

        self.cache.remove_doc_from_memory(project_id, doc_id).await?;
        tracing::debug!(%project_id, %doc_id, "evicted doc from cache");
        Ok(())
    }

    /// Accepts (removes) tracked changes without changing the text or version.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be loaded or written.
    pub async fn accept_changes(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
        change_ids: &[String],
    ) -> Result<()> {
        let doc = self.get_doc(lease, project_id, doc_id).await?;
        let ranges = self.ranges.accept_changes(&doc.ranges, change_ids)?;
        self.write_ranges(lease, project_id, doc_id, &doc, &ranges).await?;
        tracing::info!(%project_id, %doc_id, count = change_ids.len(), "accepted changes");
        Ok(())
    }

    /// Removes a comment without changing the text or version.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be loaded or written.
    pub async fn delete_comment(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
        comment_id: &str,
    ) -> Result<()> {
        let doc = self.get_doc(lease, project_id, doc_id).await?;
        let ranges = self.ranges.delete_comment(&doc.ranges, comment_id)?;
        self.write_ranges(lease, project_id, doc_id, &doc, &ranges).await?;
        tracing::info!(%project_id, %doc_id, %comment_id, "deleted comment");
        Ok(())
    }

    /// Records a new path for the document if it is cached.
    ///
    /// An unloaded document is left alone; it picks up its path from the
    /// durable store on the next load.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache write fails.
    pub async fn rename_doc(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
        new_pathname: &str,
    ) -> Result<()> {
        ensure_lease(lease, doc_id)?;
        if self.cache.set_pathname(doc_id, new_pathname).await? {
            tracing::info!(%project_id, %doc_id, pathname = new_pathname, "renamed doc");
        } else {
            tracing::debug!(%project_id, %doc_id, "doc not in cache, nothing to rename");
        }
        Ok(())
    }

    async fn write_ranges(
        &self,
        lease: &LeaseGuard,
        project_id: &ProjectId,
        doc_id: &DocId,
        doc: &LoadedDoc,
        ranges: &RangeSet,
    ) -> Result<()> {
        ensure_lease(lease, doc_id)?;
        self.cache
            .update_document(
                project_id,
                doc_id,
                DocWrite {
                    lines: &doc.lines,
                    version: doc.version,
                    applied: &[],
                    ranges,
                    updated_by: None,
                },
            )
            .await
    }
}
