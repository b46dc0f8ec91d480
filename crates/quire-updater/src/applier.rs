//! Applies a sanitized update to a document snapshot.

use std::sync::Arc;

use crate::error::{Result, UpdaterError};
use crate::op::Update;
use crate::ot::{OtCapability, ShareTextType};
use crate::text;

/// Result of applying one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    /// Document lines after the update.
    pub lines: Vec<String>,
    /// Document version after the update.
    pub version: u64,
    /// The update as applied: sanitized ops, `v` set to the version it was applied at.
    pub update: Update,
}

impl AppliedUpdate {
    /// Whether the update carried no ops (version and lines unchanged).
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.update.op.is_empty()
    }
}

/// Validates, sanitizes and applies updates through an [`OtCapability`].
#[derive(Clone)]
pub struct OperationApplier {
    ot: Arc<dyn OtCapability>,
    max_doc_length: usize,
}

impl std::fmt::Debug for OperationApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationApplier")
            .field("ot", &self.ot.name())
            .field("max_doc_length", &self.max_doc_length)
            .finish()
    }
}

impl OperationApplier {
    /// Creates an applier using the plain-text OT type.
    #[must_use]
    pub fn new(max_doc_length: usize) -> Self {
        Self::with_ot(Arc::new(ShareTextType), max_doc_length)
    }

    /// Creates an applier with a specific OT capability.
    #[must_use]
    pub fn with_ot(ot: Arc<dyn OtCapability>, max_doc_length: usize) -> Self {
        Self { ot, max_doc_length }
    }

    /// Applies `update` to the snapshot `(lines, version)`.
    ///
    /// Ops are applied in order, each against the text produced by the
    /// previous one. A non-empty update bumps the version by one; an empty
    /// update leaves lines and version unchanged.
    ///
    /// # Errors
    ///
    /// - [`UpdaterError::StaleVersion`] if `update.v != version`
    /// - [`UpdaterError::InvalidOp`] / [`UpdaterError::ConsistencyViolation`]
    ///   from the OT capability
    /// - [`UpdaterError::TooLarge`] if the resulting document exceeds the limit
    pub fn apply(&self, lines: &[String], version: u64, mut update: Update) -> Result<AppliedUpdate> {
        if update.v != version {
            return Err(UpdaterError::StaleVersion {
                expected: version,
                actual: update.v,
            });
        }

        update.sanitize();

        if update.op.is_empty() {
            return Ok(AppliedUpdate {
                lines: lines.to_vec(),
                version,
                update,
            });
        }

        let mut doc = text::join_lines(lines);
        for op in &update.op {
            doc = self.ot.apply(&doc, op)?;
        }

        if doc.contains('\0') {
            return Err(UpdaterError::invalid_op("null bytes found in doc lines"));
        }

        let new_lines = text::split_lines(&doc);
        let size = serde_json::to_string(&new_lines)?.len();
        if size > self.max_doc_length {
            return Err(UpdaterError::TooLarge {
                what: "document",
                size,
                limit: self.max_doc_length,
            });
        }

        Ok(AppliedUpdate {
            lines: new_lines,
            version: version + 1,
            update,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;
    use quire_core::DocId;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn update(v: u64, op: Vec<Op>) -> Update {
        Update::new(DocId::new("doc-1").expect("valid"), v, op)
    }

    #[test]
    fn basic_insert_bumps_version() {
        let applier = OperationApplier::new(1024);
        let applied = applier
            .apply(&lines(&["hello"]), 5, update(5, vec![Op::insert(5, " world")]))
            .expect("apply");
        assert_eq!(applied.lines, lines(&["hello world"]));
        assert_eq!(applied.version, 6);
        assert_eq!(applied.update.v, 5);
    }

    #[test]
    fn ops_apply_in_order_across_lines() {
        let applier = OperationApplier::new(1024);
        let applied = applier
            .apply(
                &lines(&["one", "two"]),
                1,
                update(1, vec![Op::insert(3, "\nthree"), Op::delete(0, "one\n")]),
            )
            .expect("apply");
        assert_eq!(applied.lines, lines(&["three", "two"]));
    }

    #[test]
    fn stale_base_is_rejected() {
        let applier = OperationApplier::new(1024);
        let err = applier
            .apply(&lines(&["hello"]), 7, update(5, vec![Op::insert(0, "x")]))
            .unwrap_err();
        assert!(matches!(
            err,
            UpdaterError::StaleVersion {
                expected: 7,
                actual: 5
            }
        ));
    }

    #[test]
    fn empty_update_is_a_noop() {
        let applier = OperationApplier::new(1024);
        let applied = applier
            .apply(&lines(&["hello"]), 3, update(3, vec![]))
            .expect("apply");
        assert!(applied.is_noop());
        assert_eq!(applied.version, 3);
        assert_eq!(applied.lines, lines(&["hello"]));
    }

    #[test]
    fn surrogates_are_sanitized_before_apply() {
        let applier = OperationApplier::new(1024);
        let applied = applier
            .apply(&lines(&["ab"]), 0, update(0, vec![Op::insert(1, "\u{1D400}")]))
            .expect("apply");
        assert_eq!(applied.lines, lines(&["a\u{FFFD}\u{FFFD}b"]));
        assert_eq!(applied.update.op[0], Op::insert(1, "\u{FFFD}\u{FFFD}"));
    }

    #[test]
    fn oversized_document_is_rejected() {
        let applier = OperationApplier::new(16);
        let err = applier
            .apply(&lines(&["a"]), 0, update(0, vec![Op::insert(1, "x".repeat(32))]))
            .unwrap_err();
        assert_eq!(err.kind(), "too_large");
    }
}
