//! Property-based tests for update pipeline invariants.
//!
//! These tests use proptest to check that arbitrary edit sequences keep the
//! document, its version and its ranges consistent with each other.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use proptest::prelude::*;
use tokio_test::block_on;

use common::Harness;
use quire_core::IdSeed;
use quire_updater::ranges::{ChangeKind, RangeMetadata, RangeSet, RangeTracker};
use quire_updater::{Op, SetDocRequest, Update};

/// An edit whose position is resolved against the text it is applied to.
#[derive(Debug, Clone)]
enum Edit {
    Insert { at: usize, text: String },
    Delete { at: usize, len: usize },
}

fn arb_edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (any::<usize>(), "[a-zé \n]{1,6}").prop_map(|(at, text)| Edit::Insert { at, text }),
        (any::<usize>(), 1_usize..5).prop_map(|(at, len)| Edit::Delete { at, len }),
    ]
}

/// Turns `edit` into an op valid against `text` and applies it there.
fn resolve(edit: &Edit, text: &mut Vec<char>) -> Option<Op> {
    match edit {
        Edit::Insert { at, text: inserted } => {
            let p = at % (text.len() + 1);
            text.splice(p..p, inserted.chars());
            Some(Op::insert(p, inserted.clone()))
        }
        Edit::Delete { at, len } => {
            if text.is_empty() {
                return None;
            }
            let p = at % text.len();
            let len = (*len).min(text.len() - p);
            let removed: String = text.drain(p..p + len).collect();
            Some(Op::delete(p, removed))
        }
    }
}

/// Position, kind and text of every tracked change, in a stable order.
fn change_layout(tracker: &RangeTracker) -> Vec<(usize, bool, String)> {
    let mut layout: Vec<(usize, bool, String)> = tracker
        .changes()
        .iter()
        .map(|c| (c.pos(), c.kind() == ChangeKind::Insert, c.text().to_string()))
        .collect();
    layout.sort();
    layout
}

fn lines_of(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Applying any valid edit sequence yields the reference text, one version per update.
    #[test]
    fn prop_updates_match_reference_text(
        edits in prop::collection::vec(arb_edit(), 1..20),
        tracked in any::<bool>(),
    ) {
        block_on(async {
            let h = Harness::new(&["the quick", "brown fox"], 0).await;
            let mut reference: Vec<char> = "the quick\nbrown fox".chars().collect();
            let mut version = 0;

            for edit in &edits {
                let Some(op) = resolve(edit, &mut reference) else { continue };
                let mut update = Update::new(h.doc.clone(), version, vec![op]).with_user("alice");
                if tracked {
                    update = update.with_tracking(format!("seed{version}"));
                }
                h.manager.submit_update(&h.project, &h.doc, update).await.unwrap();
                version += 1;
            }

            let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
            let expected: String = reference.iter().collect();
            assert_eq!(doc.lines, lines_of(&expected));
            assert_eq!(doc.version, version);
            assert!(!h.is_locked().await);
        });
    }

    /// Whole-document replacement lands exactly the requested lines.
    #[test]
    fn prop_set_doc_produces_requested_lines(
        before in prop::collection::vec("[a-c ]{0,8}", 1..4),
        after in prop::collection::vec("[a-c ]{0,8}", 1..4),
    ) {
        block_on(async {
            let before: Vec<&str> = before.iter().map(String::as_str).collect();
            let h = Harness::new(&before, 0).await;

            h.manager
                .set_doc_with_lock(&h.project, &h.doc, SetDocRequest::new(after.clone(), "prop"))
                .await
                .unwrap();

            let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
            assert_eq!(doc.lines, after);
        });
    }

    /// An insert followed by the matching delete leaves a comment where it was.
    #[test]
    fn prop_insert_then_delete_restores_comment(
        text in "[a-z ]{10,40}",
        start_seed in any::<usize>(),
        len in 1_usize..5,
        at_seed in any::<usize>(),
        inserted in "[A-Z]{1,6}",
    ) {
        let chars: Vec<char> = text.chars().collect();
        let start = start_seed % (chars.len() - len);
        let commented: String = chars[start..start + len].iter().collect();
        let at = at_seed % (chars.len() + 1);
        let meta = RangeMetadata::default();

        let mut tracker = RangeTracker::new(RangeSet::default());
        tracker.apply_op(&Op::comment(start, commented.clone(), Some("th".into())), &meta).unwrap();

        tracker.apply_op(&Op::insert(at, inserted.clone()), &meta).unwrap();
        let mut edited = chars.clone();
        edited.splice(at..at, inserted.chars());
        tracker.validate(&edited.iter().collect::<String>()).unwrap();

        tracker.apply_op(&Op::delete(at, inserted), &meta).unwrap();
        tracker.validate(&text).unwrap();

        let ranges = tracker.into_ranges();
        prop_assert_eq!(ranges.comments.len(), 1);
        prop_assert_eq!(ranges.comments[0].op.p, start);
        prop_assert_eq!(&ranges.comments[0].op.c, &commented);
    }

    /// An untracked insert followed by the matching delete leaves every
    /// tracked insert and delete where it was.
    #[test]
    fn prop_insert_then_delete_restores_tracked_changes(
        text in "[a-z ]{5,30}",
        edits in prop::collection::vec(arb_edit(), 1..12),
        at_seed in any::<usize>(),
        inserted in "[A-Z]{1,6}",
    ) {
        let mut reference: Vec<char> = text.chars().collect();
        let mut tracker = RangeTracker::new(RangeSet::default());
        tracker.set_track_changes(true);
        tracker.set_id_seed(IdSeed::from("s1"));

        // One author per edit, so unrelated inserts are never joined.
        for (n, edit) in edits.iter().enumerate() {
            let Some(op) = resolve(edit, &mut reference) else { continue };
            let author = RangeMetadata { user_id: Some(format!("u{n}")), ts: None };
            tracker.apply_op(&op, &author).unwrap();
        }
        let seeded: String = reference.iter().collect();
        tracker.validate(&seeded).unwrap();
        let before = change_layout(&tracker);

        tracker.set_track_changes(false);
        let other = RangeMetadata { user_id: Some("other".into()), ts: None };
        let at = at_seed % (reference.len() + 1);
        tracker.apply_op(&Op::insert(at, inserted.clone()), &other).unwrap();
        let mut edited = reference.clone();
        edited.splice(at..at, inserted.chars());
        tracker.validate(&edited.iter().collect::<String>()).unwrap();

        tracker.apply_op(&Op::delete(at, inserted), &other).unwrap();
        tracker.validate(&seeded).unwrap();

        prop_assert_eq!(change_layout(&tracker), before);
    }
}
