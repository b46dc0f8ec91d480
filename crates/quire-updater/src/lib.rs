//! # quire-updater
//!
//! The per-document update pipeline of Quire.
//!
//! Clients submit [`Update`]s (batches of text ops against a base version).
//! Updates are queued per document and applied by whichever worker holds the
//! document's lease, strictly in queue order:
//!
//! - **Applier**: validates the base version, sanitizes and applies the ops
//! - **Ranges**: keeps tracked changes and comments anchored to their text
//! - **Cache**: holds the working copy and the pending-update queue
//! - **Lifecycle**: loads documents on demand, flushes and evicts them
//! - **Coordinator**: runs drain cycles and the lease-guarded operations
//!
//! ## Example
//!
//! ```rust,ignore
//! let manager = UpdateManager::new(locks, cache, store, history, archiver, &config)?;
//!
//! let update = Update::new(doc_id.clone(), 5, vec![Op::insert(5, " world")]);
//! manager.submit_update(&project_id, &doc_id, update).await?;
//!
//! let doc = manager.get_doc_with_lock(&project_id, &doc_id).await?;
//! assert_eq!(doc.version, 6);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod applier;
pub mod cache;
pub mod config;
pub mod coordinator;
mod diff;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod metrics;
pub mod op;
pub mod ot;
pub mod persistence;
pub mod ranges;
mod text;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::applier::{AppliedUpdate, OperationApplier};
    pub use crate::cache::{CachedDoc, DocWrite, DocumentCache, MemoryDocumentCache};
    pub use crate::config::UpdaterConfig;
    pub use crate::coordinator::{SetDocRequest, UpdateManager};
    pub use crate::error::{Result, UpdaterError};
    pub use crate::history::{
        HistoryRecorder, MemoryHistoryRecorder, MemorySnapshotArchiver, NoopHistoryRecorder,
        SnapshotArchiver, SnapshotRecord, StorageSnapshotArchiver,
    };
    pub use crate::lifecycle::{DocumentManager, LoadedDoc};
    pub use crate::op::{Op, Update, UpdateMeta};
    pub use crate::ot::{OtCapability, ShareTextType};
    pub use crate::persistence::{DocRecord, DocStore, StorageDocStore};
    pub use crate::ranges::{
        ChangeKind, ChangeOp, CommentOp, CommentRange, RangeLimits, RangeManager, RangeMetadata,
        RangePatch, RangeSet, RangeTracker, TrackedChange,
    };
}

pub use applier::{AppliedUpdate, OperationApplier};
pub use cache::{CachedDoc, DocWrite, DocumentCache, MemoryDocumentCache};
pub use config::UpdaterConfig;
pub use coordinator::{SetDocRequest, UpdateManager};
pub use error::{Result, UpdaterError};
pub use lifecycle::{DocumentManager, LoadedDoc};
pub use op::{Op, Update, UpdateMeta};
pub use ranges::{RangeManager, RangeSet, RangeTracker};
