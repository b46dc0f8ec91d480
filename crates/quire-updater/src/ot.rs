//! Operational-transform text capability.
//!
//! The pipeline only needs the *apply* half of an OT type: updates are
//! accepted at the current version only, so no transform is performed here.
//! [`ShareTextType`] applies ops with the semantics of the `text` type used
//! by the editing clients: inserts splice, deletes and comments must match the
//! text they address.

use crate::error::{Result, UpdaterError};
use crate::op::Op;
use crate::text;

/// Applies a single op to a document's text.
pub trait OtCapability: Send + Sync + 'static {
    /// Name of the OT type (for logs).
    fn name(&self) -> &'static str;

    /// Returns the text after applying `op`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::InvalidOp`] for ops that cannot address the
    /// text, and [`UpdaterError::ConsistencyViolation`] when a delete or
    /// comment does not match the text at its position.
    fn apply(&self, text: &str, op: &Op) -> Result<String>;
}

/// Plain-text OT type with ShareJS `text` apply semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareTextType;

impl OtCapability for ShareTextType {
    fn name(&self) -> &'static str {
        "text"
    }

    fn apply(&self, doc: &str, op: &Op) -> Result<String> {
        match op {
            Op::Insert { p, i, .. } => {
                let len = text::char_len(doc);
                if *p > len {
                    return Err(UpdaterError::invalid_op(format!(
                        "insert at {p} is beyond the end of the document ({len})"
                    )));
                }
                Ok(text::splice(doc, *p, i))
            }
            Op::Delete { p, d } => {
                let deleted = text::slice(doc, *p, p + text::char_len(d));
                if deleted != d {
                    return Err(UpdaterError::consistency(format!(
                        "delete component {d:?} does not match deleted text {deleted:?}"
                    )));
                }
                Ok(text::remove(doc, *p, text::char_len(d)))
            }
            Op::Comment { p, c, .. } => {
                let commented = text::slice(doc, *p, p + text::char_len(c));
                if commented != c {
                    return Err(UpdaterError::consistency(format!(
                        "comment component {c:?} does not match text {commented:?}"
                    )));
                }
                Ok(doc.to_string())
            }
        }
    }
}
