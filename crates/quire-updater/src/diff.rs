//! Turns a whole-document replacement into text ops.

use std::time::Duration;

use similar::{Algorithm, DiffTag, TextDiff};

use crate::op::Op;
use crate::text;

/// Upper bound on diff computation; past it the diff degrades to coarser ops.
const DIFF_TIMEOUT: Duration = Duration::from_secs(1);

/// Ops that turn `before` into `after` when applied in order.
///
/// Positions are character offsets into the text as it stands when each op
/// is applied.
pub(crate) fn diff_as_ops(before: &[String], after: &[String]) -> Vec<Op> {
    let old = text::join_lines(before);
    let new = text::join_lines(after);

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .timeout(DIFF_TIMEOUT)
        .diff_chars(old.as_str(), new.as_str());

    let mut ops = Vec::new();
    let mut pos = 0;
    for op in diff.ops() {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        match tag {
            DiffTag::Equal => pos += old_range.len(),
            DiffTag::Delete => {
                ops.push(Op::delete(pos, text::slice(&old, old_range.start, old_range.end)));
            }
            DiffTag::Insert => {
                ops.push(Op::insert(pos, text::slice(&new, new_range.start, new_range.end)));
                pos += new_range.len();
            }
            DiffTag::Replace => {
                ops.push(Op::delete(pos, text::slice(&old, old_range.start, old_range.end)));
                ops.push(Op::insert(pos, text::slice(&new, new_range.start, new_range.end)));
                pos += new_range.len();
            }
        }
    }
    ops
}
