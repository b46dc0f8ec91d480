//! Durable document store.
//!
//! The durable store is the system of record for documents that are not open
//! in the cache. Documents are loaded from it on first access and written
//! back on flush.
//!
//! [`StorageDocStore`] keeps one JSON record per document on a
//! [`StorageBackend`]:
//!
//! ```text
//! docs/{project_id}/{doc_id}.json
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quire_core::{DocId, ProjectId, StorageBackend, WritePrecondition, WriteResult};

use crate::error::{Result, UpdaterError};
use crate::ranges::RangeSet;

/// Prefix for durable document records.
pub const DOC_PREFIX: &str = "docs/";

/// Durable copy of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRecord {
    /// Document lines.
    pub lines: Vec<String>,
    /// Version.
    pub version: u64,
    /// Tracked changes and comments.
    #[serde(default)]
    pub ranges: RangeSet,
    /// Document path within the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    /// History id of the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    /// Time of the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Author of the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_by: Option<String>,
}

/// Contract of the durable store.
#[async_trait]
pub trait DocStore: Send + Sync + 'static {
    /// Reads a document.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::NotFound`] if the document does not exist.
    async fn get_doc(&self, project_id: &ProjectId, doc_id: &DocId) -> Result<DocRecord>;

    /// Writes a document.
    async fn set_doc(&self, project_id: &ProjectId, doc_id: &DocId, record: &DocRecord) -> Result<()>;
}

/// [`DocStore`] backed by a [`StorageBackend`].
#[derive(Clone)]
pub struct StorageDocStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for StorageDocStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDocStore").finish_non_exhaustive()
    }
}

impl StorageDocStore {
    /// Creates a store on the given backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Storage path of a document record.
    #[must_use]
    pub fn doc_path(project_id: &ProjectId, doc_id: &DocId) -> String {
        format!("{DOC_PREFIX}{project_id}/{doc_id}.json")
    }
}

#[async_trait]
impl DocStore for StorageDocStore {
    async fn get_doc(&self, project_id: &ProjectId, doc_id: &DocId) -> Result<DocRecord> {
        let path = Self::doc_path(project_id, doc_id);
        let bytes = match self.storage.get(&path).await {
            Ok(bytes) => bytes,
            Err(quire_core::Error::NotFound(_)) => return Err(UpdaterError::not_found(doc_id)),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map_err(|e| UpdaterError::Storage {
            source: quire_core::Error::Serialization {
                message: format!("corrupt document record at {path}: {e}"),
            },
        })
    }

    async fn set_doc(&self, project_id: &ProjectId, doc_id: &DocId, record: &DocRecord) -> Result<()> {
        let path = Self::doc_path(project_id, doc_id);
        let data = Bytes::from(serde_json::to_vec(record)?);

        match self.storage.put(&path, data, WritePrecondition::None).await? {
            WriteResult::Success { version } => {
                tracing::debug!(%doc_id, doc_version = record.version, storage_version = %version, "document persisted");
                Ok(())
            }
            WriteResult::PreconditionFailed { current_version } => {
                Err(UpdaterError::from(quire_core::Error::PreconditionFailed {
                    message: format!("unconditional write to {path} rejected at {current_version}"),
                }))
            }
        }
    }
}
