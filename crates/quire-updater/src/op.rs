//! Text ops and updates.
//!
//! Ops use the compact text shape editing clients send:
//!
//! ```text
//! {"p": 5, "i": " world"}          insert " world" at 5
//! {"p": 0, "d": "hello"}           delete "hello" at 0
//! {"p": 3, "c": "lo w", "t": "x"}  comment on "lo w" at 3, thread "x"
//! ```
//!
//! Any other shape fails to deserialize.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quire_core::{DocId, IdSeed};

use crate::text;

/// A single text mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Op {
    /// Insert `i` before character `p`.
    Insert {
        /// Position in characters.
        p: usize,
        /// Inserted text.
        i: String,
        /// Set when the insert undoes a tracked delete.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        u: bool,
    },
    /// Delete `d`, which must be the text at `p`.
    Delete {
        /// Position in characters.
        p: usize,
        /// Deleted text.
        d: String,
    },
    /// Annotate `c`, which must be the text at `p`. Never moves text.
    Comment {
        /// Position in characters.
        p: usize,
        /// Commented text.
        c: String,
        /// Thread id; a new id is generated when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        t: Option<String>,
    },
}

impl Op {
    /// Creates an insert op.
    #[must_use]
    pub fn insert(p: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            p,
            i: text.into(),
            u: false,
        }
    }

    /// Creates a delete op.
    #[must_use]
    pub fn delete(p: usize, text: impl Into<String>) -> Self {
        Self::Delete { p, d: text.into() }
    }

    /// Creates a comment op.
    #[must_use]
    pub fn comment(p: usize, text: impl Into<String>, thread_id: Option<String>) -> Self {
        Self::Comment {
            p,
            c: text.into(),
            t: thread_id,
        }
    }

    /// Marks an insert as undoing a tracked delete. No effect on other ops.
    pub fn mark_undo(&mut self) {
        if let Self::Insert { u, .. } = self {
            *u = true;
        }
    }

    fn sanitize(&mut self) {
        let field = match self {
            Self::Insert { i, .. } => i,
            Self::Delete { d, .. } => d,
            Self::Comment { c, .. } => c,
        };
        if let std::borrow::Cow::Owned(clean) = text::sanitize(field) {
            *field = clean;
        }
    }
}

/// Metadata carried by an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMeta {
    /// Originating client connection (or `"external"` source for `set_doc`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Author of the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Track-changes id seed; present (and non-empty) iff tracking is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tc: Option<String>,

    /// Client timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,

    /// Update type (`"external"` for whole-document replacements).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Document path, added before the update is handed to history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,

    /// Document length before the update, added before the update is handed to history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_length: Option<usize>,
}

/// A batch of ops applied atomically against one base version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Target document.
    pub doc: DocId,

    /// Base version; after application, the version the update was applied at.
    pub v: u64,

    /// Ops, applied in order.
    #[serde(default)]
    pub op: Vec<Op>,

    /// Update metadata.
    #[serde(default)]
    pub meta: UpdateMeta,

    /// History id of the document, added before the update is handed to history.
    #[serde(
        rename = "projectHistoryId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub history_id: Option<String>,
}

impl Update {
    /// Creates an update with empty metadata.
    #[must_use]
    pub fn new(doc: DocId, v: u64, op: Vec<Op>) -> Self {
        Self {
            doc,
            v,
            op,
            meta: UpdateMeta::default(),
            history_id: None,
        }
    }

    /// Sets the author.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.meta.user_id = Some(user_id.into());
        self
    }

    /// Turns on change tracking with the given id seed.
    #[must_use]
    pub fn with_tracking(mut self, seed: impl Into<String>) -> Self {
        self.meta.tc = Some(seed.into());
        self
    }

    /// Sets the source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = Some(source.into());
        self
    }

    /// Track-changes seed, if tracking is on for this update.
    #[must_use]
    pub fn tracking_seed(&self) -> Option<IdSeed> {
        self.meta
            .tc
            .as_deref()
            .filter(|seed| !seed.is_empty())
            .map(IdSeed::from)
    }

    /// Replaces characters outside the Basic Multilingual Plane in every op.
    pub fn sanitize(&mut self) {
        for op in &mut self.op {
            op.sanitize();
        }
    }
}
