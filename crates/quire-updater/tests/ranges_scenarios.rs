//! End-to-end tracked change and comment scenarios.
//!
//! Each test drives updates through the coordinator and checks the ranges
//! stored alongside the document, not just the tracker in isolation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::Harness;
use quire_updater::ranges::{ChangeKind, ChangeOp};
use quire_updater::{Op, Update, UpdaterConfig, UpdaterError};

#[tokio::test]
async fn test_tracked_insert_then_accept() {
    let h = Harness::new(&["hello"], 0).await;
    let update = Update::new(h.doc.clone(), 0, vec![Op::insert(5, " world")])
        .with_user("alice")
        .with_tracking("s1");
    h.manager.submit_update(&h.project, &h.doc, update).await.unwrap();

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert_eq!(doc.lines, vec!["hello world".to_string()]);
    assert_eq!(doc.ranges.changes.len(), 1);
    let change = &doc.ranges.changes[0];
    assert_eq!(change.id, "s1000001");
    assert_eq!(change.kind(), ChangeKind::Insert);
    assert_eq!(change.op, ChangeOp::Insert { p: 5, i: " world".into() });
    assert_eq!(change.metadata.user_id.as_deref(), Some("alice"));
    assert!(change.metadata.ts.is_some());

    h.manager
        .accept_changes_with_lock(&h.project, &h.doc, &["s1000001".to_string()])
        .await
        .unwrap();

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert!(doc.ranges.changes.is_empty());
    assert_eq!(doc.lines, vec!["hello world".to_string()]);
    assert_eq!(doc.version, 1, "accepting changes does not bump the version");
}

#[tokio::test]
async fn test_tracked_delete_keeps_deleted_text() {
    let h = Harness::new(&["hello world"], 3).await;
    let update = Update::new(h.doc.clone(), 3, vec![Op::delete(6, "world")])
        .with_user("bob")
        .with_tracking("d1");
    h.manager.submit_update(&h.project, &h.doc, update).await.unwrap();

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert_eq!(doc.lines, vec!["hello ".to_string()]);
    assert_eq!(doc.version, 4);
    assert_eq!(
        doc.ranges.changes.iter().map(|c| c.op.clone()).collect::<Vec<_>>(),
        vec![ChangeOp::Delete { p: 6, d: "world".into() }]
    );
}

#[tokio::test]
async fn test_comment_follows_text_across_lines() {
    let h = Harness::new(&["ab", "cd"], 0).await;
    let comment = Update::new(h.doc.clone(), 0, vec![Op::comment(3, "cd", Some("th1".into()))])
        .with_user("carol");
    h.manager.submit_update(&h.project, &h.doc, comment).await.unwrap();

    let insert = Update::new(h.doc.clone(), 1, vec![Op::insert(0, "XX\n")]);
    h.manager.submit_update(&h.project, &h.doc, insert).await.unwrap();

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert_eq!(doc.lines, vec!["XX".to_string(), "ab".to_string(), "cd".to_string()]);
    let comment = doc.ranges.comment("th1").expect("comment kept");
    assert_eq!(comment.op.p, 6);
    assert_eq!(comment.op.c, "cd");

    h.manager
        .delete_comment_with_lock(&h.project, &h.doc, "th1")
        .await
        .unwrap();
    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert!(doc.ranges.comments.is_empty());
    assert_eq!(doc.version, 2);
}

#[tokio::test]
async fn test_change_cap_leaves_document_unchanged() {
    let config = UpdaterConfig {
        max_changes: 1,
        ..UpdaterConfig::default()
    };
    let h = Harness::with_config(&["text"], 0, config).await;

    let first = Update::new(h.doc.clone(), 0, vec![Op::insert(0, "a")])
        .with_user("alice")
        .with_tracking("s1");
    h.manager.submit_update(&h.project, &h.doc, first).await.unwrap();

    let second = Update::new(h.doc.clone(), 1, vec![Op::insert(5, "b")])
        .with_user("bob")
        .with_tracking("s2");
    let err = h.manager.submit_update(&h.project, &h.doc, second).await.unwrap_err();
    assert!(matches!(
        err,
        UpdaterError::CapacityExceeded {
            kind: "changes",
            count: 2,
            limit: 1
        }
    ));

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert_eq!(doc.lines, vec!["atext".to_string()]);
    assert_eq!(doc.version, 1);
    assert_eq!(doc.ranges.changes.len(), 1);
    assert_eq!(h.history.recorded().unwrap().len(), 1);
}

#[tokio::test]
async fn test_comment_not_matching_text_is_rejected() {
    let h = Harness::new(&["hello"], 0).await;
    let comment = Update::new(h.doc.clone(), 0, vec![Op::comment(0, "jello", None)]);

    let err = h.manager.submit_update(&h.project, &h.doc, comment).await.unwrap_err();
    assert_eq!(err.kind(), "consistency_violation");

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert!(doc.ranges.is_empty());
    assert_eq!(doc.version, 0);
}

#[tokio::test]
async fn test_collapsed_comment_is_kept_and_snapshotted() {
    let h = Harness::new(&["one two three"], 0).await;
    let comment = Update::new(h.doc.clone(), 0, vec![Op::comment(4, "two", Some("th1".into()))]);
    h.manager.submit_update(&h.project, &h.doc, comment).await.unwrap();

    let delete = Update::new(h.doc.clone(), 1, vec![Op::delete(3, " two")]);
    h.manager.submit_update(&h.project, &h.doc, delete).await.unwrap();

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert_eq!(doc.lines, vec!["one three".to_string()]);
    let comment = doc.ranges.comment("th1").expect("collapsed comment kept");
    assert_eq!((comment.op.p, comment.op.c.as_str()), (3, ""));

    let snapshots = h.archiver.snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].lines, vec!["one two three".to_string()]);
    assert_eq!(snapshots[0].pathname.as_deref(), Some("/main.tex"));
}

#[tokio::test]
async fn test_ranges_survive_flush_and_reload() {
    let h = Harness::new(&["hello"], 0).await;
    let update = Update::new(h.doc.clone(), 0, vec![Op::insert(0, ">> ")]).with_tracking("s1");
    h.manager.submit_update(&h.project, &h.doc, update).await.unwrap();

    h.manager
        .flush_and_delete_doc_with_lock(&h.project, &h.doc, false)
        .await
        .unwrap();
    assert!(h.cache.is_empty().unwrap());

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert!(!doc.already_loaded);
    assert_eq!(doc.lines, vec![">> hello".to_string()]);
    assert_eq!(doc.ranges.change("s1000001").map(|c| c.pos()), Some(0));
}
