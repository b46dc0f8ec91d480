//! Tracked changes and comments.
//!
//! A [`RangeSet`] records two kinds of annotations on a document:
//! - **Changes**: inserts whose text is still in the document, and deletes
//!   whose text is gone but retained as a zero-width tombstone for review
//! - **Comments**: annotated spans of the current text
//!
//! Every op applied to the document is replayed through a [`RangeTracker`] so
//! that the ranges keep addressing the same text:
//!
//! ```text
//!             this is the current text of the document
//!                         |-----|            |
//!  {i: "current ", p:12} -^                   ^- {d: "old ", p: 31}
//! ```
//!
//! Inserts occupy document text, so they shift later positions. Deletes do
//! not, since their text is no longer there.
//!
//! # Track-changes rules
//!
//! - Inserting inside (or touching) an insert by the same user extends it
//! - Inserting inside an insert by another user, or with tracking off,
//!   splits it in two
//! - Inserting at a delete goes before the delete; an undo insert whose text
//!   starts the delete shrinks the delete instead
//! - Deleting inserted text removes it from the insert and adds no delete
//! - Deletes overlapping other deletes merge into one
//!
//! [`RangeManager`] wraps the tracker with the per-update policy: caps,
//! validation against the new text, and collapse detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quire_core::{IdSeed, RangeIdGenerator};

use crate::error::{Result, UpdaterError};
use crate::op::{Op, Update};
use crate::text::{self, CharIndex};

/// Author and time of a tracked change or comment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMetadata {
    /// Author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Time of the edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

/// Kind of tracked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Inserted text, still present in the document.
    Insert,
    /// Deleted text, no longer present.
    Delete,
}

/// Position and text of a tracked change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangeOp {
    /// Inserted text `i` starting at `p`.
    Insert {
        /// Position in characters.
        p: usize,
        /// Inserted text.
        i: String,
    },
    /// Deleted text `d` that used to start at `p`.
    Delete {
        /// Position in characters.
        p: usize,
        /// Deleted text.
        d: String,
    },
}

/// A tracked insert or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedChange {
    /// Change id.
    pub id: String,
    /// Position and text.
    pub op: ChangeOp,
    /// Author and time.
    #[serde(default)]
    pub metadata: RangeMetadata,
}

impl TrackedChange {
    /// Kind of change.
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self.op {
            ChangeOp::Insert { .. } => ChangeKind::Insert,
            ChangeOp::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// Position in characters.
    #[must_use]
    pub const fn pos(&self) -> usize {
        match self.op {
            ChangeOp::Insert { p, .. } | ChangeOp::Delete { p, .. } => p,
        }
    }

    /// Inserted or deleted text.
    #[must_use]
    pub fn text(&self) -> &str {
        match &self.op {
            ChangeOp::Insert { i, .. } => i,
            ChangeOp::Delete { d, .. } => d,
        }
    }

    /// Length in characters of the inserted or deleted text.
    #[must_use]
    pub fn len(&self) -> usize {
        text::char_len(self.text())
    }

    /// Whether the change covers no text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
    }
}

/// Position and text of a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentOp {
    /// Position in characters.
    pub p: usize,
    /// Commented text.
    pub c: String,
    /// Thread id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// A comment anchored on a span of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRange {
    /// Comment (thread) id.
    pub id: String,
    /// Position and text.
    pub op: CommentOp,
    /// Author and time.
    #[serde(default)]
    pub metadata: RangeMetadata,
    /// Whether the thread has been resolved.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resolved: bool,
}

impl CommentRange {
    /// Position in characters.
    #[must_use]
    pub const fn pos(&self) -> usize {
        self.op.p
    }

    /// Length in characters of the commented text.
    #[must_use]
    pub fn len(&self) -> usize {
        text::char_len(&self.op.c)
    }

    /// Whether the comment covers no text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.op.c.is_empty()
    }
}

/// Tracked changes and comments of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    /// Tracked changes, ordered by position with deletes before inserts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<TrackedChange>,
    /// Comments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<CommentRange>,
}

impl RangeSet {
    /// Whether there are no changes and no comments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.comments.is_empty()
    }

    /// Looks up a tracked change.
    #[must_use]
    pub fn change(&self, id: &str) -> Option<&TrackedChange> {
        self.changes.iter().find(|c| c.id == id)
    }

    /// Looks up a comment.
    #[must_use]
    pub fn comment(&self, id: &str) -> Option<&CommentRange> {
        self.comments.iter().find(|c| c.id == id)
    }

    /// Number of ranges whose text has been reduced to nothing.
    #[must_use]
    pub fn empty_range_count(&self) -> usize {
        let changes = self
            .changes
            .iter()
            .filter(|c| c.kind() == ChangeKind::Insert && c.is_empty())
            .count();
        let comments = self.comments.iter().filter(|c| c.is_empty()).count();
        changes + comments
    }
}

/// Pending edit to the text of a delete op being applied to changes.
#[derive(Debug)]
enum Modification {
    Insert { p: usize, i: String },
    Delete { p: usize, d: String },
}

impl Modification {
    const fn pos(&self) -> usize {
        match self {
            Self::Insert { p, .. } | Self::Delete { p, .. } => *p,
        }
    }
}

/// Replays applied ops over a [`RangeSet`].
#[derive(Debug, Clone)]
pub struct RangeTracker {
    changes: Vec<TrackedChange>,
    comments: Vec<CommentRange>,
    ids: RangeIdGenerator,
    track_changes: bool,
}

impl RangeTracker {
    /// Creates a tracker over existing ranges, with tracking off and a fresh id seed.
    #[must_use]
    pub fn new(ranges: RangeSet) -> Self {
        Self {
            changes: ranges.changes,
            comments: ranges.comments,
            ids: RangeIdGenerator::default(),
            track_changes: false,
        }
    }

    /// Turns change tracking on or off for subsequent ops.
    pub fn set_track_changes(&mut self, on: bool) {
        self.track_changes = on;
    }

    /// Sets the seed for newly generated ids and resets the increment.
    pub fn set_id_seed(&mut self, seed: IdSeed) {
        self.ids.reseed(seed);
    }

    /// Current tracked changes.
    #[must_use]
    pub fn changes(&self) -> &[TrackedChange] {
        &self.changes
    }

    /// Current comments.
    #[must_use]
    pub fn comments(&self) -> &[CommentRange] {
        &self.comments
    }

    /// Consumes the tracker, returning the ranges.
    #[must_use]
    pub fn into_ranges(self) -> RangeSet {
        RangeSet {
            changes: self.changes,
            comments: self.comments,
        }
    }

    /// Removes the given changes (accepting or rejecting them). Unknown ids are ignored.
    pub fn remove_change_ids(&mut self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        self.changes.retain(|c| !ids.contains(&c.id));
    }

    /// Removes a comment. Unknown ids are ignored.
    pub fn remove_comment_id(&mut self, id: &str) {
        self.comments.retain(|c| c.id != id);
    }

    /// Updates the ranges for an op that has been applied to the document.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::ConsistencyViolation`] if a delete removes text
    /// that disagrees with a tracked range it overlaps.
    pub fn apply_op(&mut self, op: &Op, metadata: &RangeMetadata) -> Result<()> {
        match op {
            Op::Insert { p, i, u } => {
                self.apply_insert_to_changes(*p, i, *u, metadata);
                self.apply_insert_to_comments(*p, i);
                Ok(())
            }
            Op::Delete { p, d } => {
                self.apply_delete_to_changes(*p, d, metadata)?;
                self.apply_delete_to_comments(*p, d)
            }
            Op::Comment { p, c, t } => {
                self.add_comment(*p, c, t.as_deref(), metadata);
                Ok(())
            }
        }
    }

    /// Checks every range against the document text.
    ///
    /// Insert changes and comments must match the text at their position;
    /// delete changes must sit within the document.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::ConsistencyViolation`] describing the first
    /// mismatching range.
    pub fn validate(&self, doc: &str) -> Result<()> {
        let index = CharIndex::new(doc);
        for change in &self.changes {
            match &change.op {
                ChangeOp::Insert { p, i } => {
                    let content = index.slice(*p, text::char_len(i));
                    if content != i {
                        return Err(UpdaterError::consistency(format!(
                            "change {} ({i:?} at {p}) doesn't match text ({content:?})",
                            change.id
                        )));
                    }
                }
                ChangeOp::Delete { p, .. } => {
                    if *p > index.len() {
                        return Err(UpdaterError::consistency(format!(
                            "change {} (delete at {p}) is beyond the end of the document ({})",
                            change.id,
                            index.len()
                        )));
                    }
                }
            }
        }
        for comment in &self.comments {
            let content = index.slice(comment.op.p, comment.len());
            if content != comment.op.c {
                return Err(UpdaterError::consistency(format!(
                    "comment {} ({:?} at {}) doesn't match text ({content:?})",
                    comment.id, comment.op.c, comment.op.p
                )));
            }
        }
        Ok(())
    }

    fn add_comment(&mut self, p: usize, c: &str, thread: Option<&str>, metadata: &RangeMetadata) {
        if let Some(existing) = thread.and_then(|t| self.comments.iter_mut().find(|x| x.id == t)) {
            existing.op.p = p;
            existing.op.c = c.to_string();
            return;
        }

        let id = thread.map_or_else(|| self.ids.next_id(), str::to_string);
        self.comments.push(CommentRange {
            id,
            op: CommentOp {
                p,
                c: c.to_string(),
                t: thread.map(str::to_string),
            },
            metadata: metadata.clone(),
            resolved: false,
        });
    }

    fn apply_insert_to_comments(&mut self, op_start: usize, inserted: &str) {
        let op_len = text::char_len(inserted);
        for comment in &mut self.comments {
            let comment_start = comment.op.p;
            let comment_end = comment_start + text::char_len(&comment.op.c);
            if op_start <= comment_start {
                comment.op.p += op_len;
            } else if op_start < comment_end {
                comment.op.c = text::splice(&comment.op.c, op_start - comment_start, inserted);
            }
        }
    }

    fn apply_delete_to_comments(&mut self, op_start: usize, deleted: &str) -> Result<()> {
        let op_len = text::char_len(deleted);
        let op_end = op_start + op_len;
        for comment in &mut self.comments {
            let comment_start = comment.op.p;
            let comment_len = text::char_len(&comment.op.c);
            let comment_end = comment_start + comment_len;

            if op_end <= comment_start {
                comment.op.p -= op_len;
            } else if op_start >= comment_end {
                // Delete is entirely after the comment.
            } else {
                let remaining_before = if op_start <= comment_start {
                    ""
                } else {
                    text::slice(&comment.op.c, 0, op_start - comment_start)
                };
                let remaining_after = if op_end >= comment_end {
                    ""
                } else {
                    text::slice_from(&comment.op.c, op_end - comment_start)
                };

                let before_len = text::char_len(remaining_before);
                let after_len = text::char_len(remaining_after);
                let deleted_comment =
                    text::slice(&comment.op.c, before_len, comment_len - after_len);
                let offset = comment_start.saturating_sub(op_start);
                let deleted_op_content = text::slice(
                    deleted,
                    offset,
                    offset + text::char_len(deleted_comment),
                );
                if deleted_comment != deleted_op_content {
                    return Err(UpdaterError::consistency(format!(
                        "deleted content {deleted_op_content:?} does not match comment {} content {deleted_comment:?}",
                        comment.id
                    )));
                }

                let remaining = format!("{remaining_before}{remaining_after}");
                comment.op.p = comment_start.min(op_start);
                comment.op.c = remaining;
            }
        }
        Ok(())
    }

    fn apply_insert_to_changes(
        &mut self,
        op_start: usize,
        inserted: &str,
        undoing: bool,
        metadata: &RangeMetadata,
    ) {
        let op_len = text::char_len(inserted);
        let op_end = op_start + op_len;
        let track_changes = self.track_changes;

        let mut already_merged = false;
        // Position of the previous change, if it was a delete (after any shift).
        let mut previous_delete: Option<usize> = None;
        let mut remove_ids: Vec<String> = Vec::new();
        let mut split_changes: Vec<(ChangeOp, RangeMetadata)> = Vec::new();

        for idx in 0..self.changes.len() {
            // Read before the next change is shifted by this loop.
            let next_delete = match self.changes.get(idx + 1).map(|c| &c.op) {
                Some(ChangeOp::Delete { p, d }) => Some((*p, d.starts_with(inserted))),
                _ => None,
            };

            let change = &mut self.changes[idx];
            match &mut change.op {
                ChangeOp::Delete { p, d } => {
                    if op_start < *p {
                        *p += op_len;
                    } else if op_start == *p {
                        // An undo insert re-inserting the start of the delete
                        // cancels that part of the delete.
                        if undoing && d.starts_with(inserted) {
                            *d = text::slice_from(d, op_len).to_string();
                            *p += op_len;
                            if d.is_empty() {
                                remove_ids.push(change.id.clone());
                            }
                            already_merged = true;
                        } else {
                            *p += op_len;
                        }
                    }
                    previous_delete = Some(*p);
                }
                ChangeOp::Insert { p, i } => {
                    let change_start = *p;
                    let change_end = change_start + text::char_len(i);
                    let is_overlapping = op_start >= change_start && op_start <= change_end;
                    let is_same_user = metadata.user_id == change.metadata.user_id;

                    // An undo insert right at the end of this insert that
                    // cancels the following delete must not also extend
                    // this insert.
                    let will_cancel_next_delete = undoing
                        && op_start == change_end
                        && next_delete.is_some_and(|(next_p, starts)| next_p == op_start && starts);

                    // A delete sitting at the end of this insert partitions
                    // it from the insert that follows.
                    let is_blocked_by_delete = previous_delete == Some(op_end);

                    if track_changes
                        && is_overlapping
                        && !is_blocked_by_delete
                        && !already_merged
                        && !will_cancel_next_delete
                        && is_same_user
                    {
                        *i = text::splice(i, op_start - change_start, inserted);
                        change.metadata.ts = metadata.ts;
                        already_merged = true;
                    } else if op_start <= change_start {
                        *p += op_len;
                    } else if (!is_same_user || !track_changes)
                        && change_start < op_start
                        && op_start < change_end
                    {
                        // Inserting inside someone else's insert: split it.
                        let offset = op_start - change_start;
                        let after = text::slice_from(i, offset).to_string();
                        *i = text::slice(i, 0, offset).to_string();
                        split_changes.push((
                            ChangeOp::Insert {
                                p: change_start + offset + op_len,
                                i: after,
                            },
                            change.metadata.clone(),
                        ));
                    }
                    previous_delete = None;
                }
            }
        }

        if track_changes && !already_merged {
            self.add_change(
                ChangeOp::Insert {
                    p: op_start,
                    i: inserted.to_string(),
                },
                metadata.clone(),
            );
        }
        for (op, split_metadata) in split_changes {
            self.add_change(op, split_metadata);
        }
        if !remove_ids.is_empty() {
            self.changes.retain(|c| !remove_ids.contains(&c.id));
        }
    }

    fn apply_delete_to_changes(
        &mut self,
        op_start: usize,
        deleted: &str,
        metadata: &RangeMetadata,
    ) -> Result<()> {
        let op_len = text::char_len(deleted);
        let op_end = op_start + op_len;
        let track_changes = self.track_changes;

        let mut remove_ids: Vec<String> = Vec::new();
        // Edits to the delete's own text, applied after the scan so that
        // offsets into `deleted` stay valid while scanning.
        let mut modifications: Vec<Modification> = Vec::new();

        for change in &mut self.changes {
            match &mut change.op {
                ChangeOp::Insert { p, i } => {
                    let change_start = *p;
                    let change_end = change_start + text::char_len(i);
                    if op_end <= change_start {
                        *p -= op_len;
                    } else if op_start >= change_end {
                        // Delete is after the insert.
                    } else {
                        // Overlap: the insert and the delete cancel out where
                        // they overlap.
                        let (delete_before, insert_before) = if op_start >= change_start {
                            (0, text::slice(i, 0, op_start - change_start).to_string())
                        } else {
                            (change_start - op_start, String::new())
                        };
                        let (delete_after, insert_after) = if op_end <= change_end {
                            (0, text::slice_from(i, op_end - change_start).to_string())
                        } else {
                            (op_end - change_end, String::new())
                        };

                        let insert_remaining = insert_before + &insert_after;
                        if insert_remaining.is_empty() {
                            remove_ids.push(change.id.clone());
                        } else {
                            *i = insert_remaining;
                            *p = change_start.min(op_start);
                            change.metadata.ts = metadata.ts;
                        }

                        let removed_len = op_len - delete_before - delete_after;
                        let removed =
                            text::slice(deleted, delete_before, delete_before + removed_len);
                        if !removed.is_empty() {
                            modifications.push(Modification::Delete {
                                p: delete_before,
                                d: removed.to_string(),
                            });
                        }
                    }
                }
                ChangeOp::Delete { p, d } => {
                    let change_start = *p;
                    if op_end < change_start || (!track_changes && op_end == change_start) {
                        *p -= op_len;
                    } else if op_start <= change_start && change_start <= op_end {
                        if track_changes {
                            // Absorb the overlapped delete into this one.
                            modifications.push(Modification::Insert {
                                p: change_start - op_start,
                                i: d.clone(),
                            });
                            remove_ids.push(change.id.clone());
                        } else {
                            *p = op_start;
                        }
                    }
                }
            }
        }

        let mut remaining = apply_modifications(deleted, modifications)?;

        let mut reused = false;
        for id in remove_ids {
            let Some(idx) = self.changes.iter().position(|c| c.id == id) else {
                continue;
            };
            // Reuse an absorbed delete for the merged delete instead of
            // removing one and adding another.
            let reuse = !remaining.is_empty()
                && matches!(
                    self.changes[idx].op,
                    ChangeOp::Delete { p, .. }
                        if op_start <= p && p <= op_start + text::char_len(&remaining)
                );
            if reuse {
                let change = &mut self.changes[idx];
                change.op = ChangeOp::Delete {
                    p: op_start,
                    d: std::mem::take(&mut remaining),
                };
                change.metadata = metadata.clone();
                reused = true;
            } else {
                self.changes.remove(idx);
            }
        }
        if reused {
            self.sort_changes();
        }

        if track_changes && !remaining.is_empty() {
            self.add_change(
                ChangeOp::Delete {
                    p: op_start,
                    d: remaining,
                },
                metadata.clone(),
            );
        } else {
            // Deleting an insert between two inserts by one user leaves them
            // adjacent.
            self.merge_adjacent_changes();
        }
        Ok(())
    }

    fn add_change(&mut self, op: ChangeOp, metadata: RangeMetadata) {
        let id = self.ids.next_id();
        self.changes.push(TrackedChange { id, op, metadata });
        self.sort_changes();
    }

    /// Orders changes by position, deletes before inserts (stable).
    fn sort_changes(&mut self) {
        self.changes.sort_by(|a, b| {
            a.pos()
                .cmp(&b.pos())
                .then_with(|| kind_rank(a.kind()).cmp(&kind_rank(b.kind())))
        });
    }

    fn merge_adjacent_changes(&mut self) {
        let changes = std::mem::take(&mut self.changes);
        let mut merged: Vec<TrackedChange> = Vec::with_capacity(changes.len());
        for change in changes {
            if let Some(previous) = merged.last_mut() {
                let same_user = previous.metadata.user_id == change.metadata.user_id;
                match (&mut previous.op, &change.op) {
                    (ChangeOp::Insert { p: pp, i: pi }, ChangeOp::Insert { p, i })
                        if same_user && *pp + text::char_len(pi) == *p =>
                    {
                        pi.push_str(i);
                        continue;
                    }
                    (ChangeOp::Delete { p: pp, d: pd }, ChangeOp::Delete { p, d }) if pp == p => {
                        pd.push_str(d);
                        continue;
                    }
                    _ => {}
                }
            }
            merged.push(change);
        }
        self.changes = merged;
    }
}

const fn kind_rank(kind: ChangeKind) -> u8 {
    match kind {
        ChangeKind::Delete => 0,
        ChangeKind::Insert => 1,
    }
}

/// Applies modifications in descending position order, deletes first at
/// equal positions, so earlier offsets stay valid.
fn apply_modifications(content: &str, mut modifications: Vec<Modification>) -> Result<String> {
    modifications.sort_by(|a, b| {
        b.pos().cmp(&a.pos()).then_with(|| {
            let rank = |m: &Modification| u8::from(matches!(m, Modification::Insert { .. }));
            rank(a).cmp(&rank(b))
        })
    });

    let mut content = content.to_string();
    for modification in modifications {
        match modification {
            Modification::Insert { p, i } => content = text::splice(&content, p, &i),
            Modification::Delete { p, d } => {
                let len = text::char_len(&d);
                let current = text::slice(&content, p, p + len);
                if current != d {
                    return Err(UpdaterError::consistency(format!(
                        "deleted content does not match tracked insert: content {content:?}, expected {d:?} at {p}"
                    )));
                }
                content = text::remove(&content, p, len);
            }
        }
    }
    Ok(content)
}

/// Hard limits on a document's ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeLimits {
    /// Maximum tracked changes.
    pub max_changes: usize,
    /// Maximum comments.
    pub max_comments: usize,
    /// Maximum JSON-encoded size in bytes.
    pub max_ranges_size: usize,
}

impl Default for RangeLimits {
    fn default() -> Self {
        Self {
            max_changes: 2_000,
            max_comments: 500,
            max_ranges_size: 3 * 1024 * 1024,
        }
    }
}

/// Ranges after an update, plus collapse detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePatch {
    /// New ranges.
    pub ranges: RangeSet,
    /// Whether the update reduced a previously non-empty range to zero length.
    pub collapsed: bool,
}

/// Applies per-update range policy on top of [`RangeTracker`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeManager {
    limits: RangeLimits,
}

impl RangeManager {
    /// Creates a manager with the given limits.
    #[must_use]
    pub const fn new(limits: RangeLimits) -> Self {
        Self { limits }
    }

    /// Patches `ranges` with an applied update and validates the result
    /// against `new_lines`.
    ///
    /// Tracking is on iff the update carries a non-empty `tc` seed, which
    /// also seeds the ids of changes created by this update.
    ///
    /// # Errors
    ///
    /// - [`UpdaterError::ConsistencyViolation`] if ranges disagree with the text
    /// - [`UpdaterError::CapacityExceeded`] if a cap is exceeded
    /// - [`UpdaterError::TooLarge`] if the encoded ranges exceed the size limit
    pub fn apply_update(
        &self,
        ranges: &RangeSet,
        update: &Update,
        new_lines: &[String],
    ) -> Result<RangePatch> {
        let empty_before = ranges.empty_range_count();
        let mut tracker = RangeTracker::new(ranges.clone());

        let seed = update.tracking_seed();
        tracker.set_track_changes(seed.is_some());
        if let Some(seed) = seed {
            tracker.set_id_seed(seed);
        }

        let metadata = RangeMetadata {
            user_id: update.meta.user_id.clone(),
            ts: Some(update.meta.ts.unwrap_or_else(Utc::now)),
        };
        for op in &update.op {
            tracker.apply_op(op, &metadata)?;
        }

        self.check_caps(&tracker)?;
        tracker.validate(&text::join_lines(new_lines))?;

        let ranges = tracker.into_ranges();
        self.check_size(&ranges)?;

        let collapsed = ranges.empty_range_count() > empty_before;
        Ok(RangePatch { ranges, collapsed })
    }

    /// Removes accepted (or rejected) changes.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::TooLarge`] if the remaining ranges are still too large.
    pub fn accept_changes(&self, ranges: &RangeSet, change_ids: &[String]) -> Result<RangeSet> {
        let mut tracker = RangeTracker::new(ranges.clone());
        tracker.remove_change_ids(change_ids);
        let ranges = tracker.into_ranges();
        self.check_size(&ranges)?;
        Ok(ranges)
    }

    /// Removes a comment.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::TooLarge`] if the remaining ranges are still too large.
    pub fn delete_comment(&self, ranges: &RangeSet, comment_id: &str) -> Result<RangeSet> {
        let mut tracker = RangeTracker::new(ranges.clone());
        tracker.remove_comment_id(comment_id);
        let ranges = tracker.into_ranges();
        self.check_size(&ranges)?;
        Ok(ranges)
    }

    fn check_caps(&self, tracker: &RangeTracker) -> Result<()> {
        if tracker.changes().len() > self.limits.max_changes {
            return Err(UpdaterError::CapacityExceeded {
                kind: "changes",
                count: tracker.changes().len(),
                limit: self.limits.max_changes,
            });
        }
        if tracker.comments().len() > self.limits.max_comments {
            return Err(UpdaterError::CapacityExceeded {
                kind: "comments",
                count: tracker.comments().len(),
                limit: self.limits.max_comments,
            });
        }
        Ok(())
    }

    fn check_size(&self, ranges: &RangeSet) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        let size = serde_json::to_vec(ranges)?.len();
        if size > self.limits.max_ranges_size {
            return Err(UpdaterError::TooLarge {
                what: "ranges",
                size,
                limit: self.limits.max_ranges_size,
            });
        }
        Ok(())
    }
}
