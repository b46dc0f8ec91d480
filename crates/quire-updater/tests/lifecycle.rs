//! Integration tests for loading, flushing, evicting and replacing documents.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use common::{Harness, owned};
use quire_core::DocId;
use quire_updater::coordinator::EXTERNAL_UPDATE;
use quire_updater::persistence::DocStore;
use quire_updater::ranges::ChangeOp;
use quire_updater::{Op, SetDocRequest, Update, UpdaterConfig};

async fn stored_version(h: &Harness) -> u64 {
    h.store.get_doc(&h.project, &h.doc).await.unwrap().version
}

async fn insert(h: &Harness, v: u64, p: usize, text: &str) {
    let update = Update::new(h.doc.clone(), v, vec![Op::insert(p, text)]);
    h.manager.submit_update(&h.project, &h.doc, update).await.unwrap();
}

// ============================================================================
// Flushing
// ============================================================================

#[tokio::test]
async fn test_flush_writes_back_and_clears_unflushed_time() {
    let h = Harness::new(&["hello"], 0).await;
    insert(&h, 0, 5, "!").await;

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert!(doc.unflushed_time.is_some());
    assert_eq!(stored_version(&h).await, 0);

    let flushed = h.manager.flush_doc_if_loaded_with_lock(&h.project, &h.doc).await.unwrap();
    assert!(flushed);
    assert_eq!(stored_version(&h).await, 1);

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert!(doc.unflushed_time.is_none());
    assert!(doc.already_loaded, "flushing keeps the document cached");
}

#[tokio::test]
async fn test_flush_error_keeps_document_cached() {
    let h = Harness::new(&["hello"], 0).await;
    insert(&h, 0, 0, ">").await;
    h.store.set_fail_writes(true);

    let err = h
        .manager
        .flush_doc_if_loaded_with_lock(&h.project, &h.doc)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "storage");

    let err = h
        .manager
        .flush_and_delete_doc_with_lock(&h.project, &h.doc, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "storage");
    assert_eq!(h.cache.len().unwrap(), 1);

    h.manager
        .flush_and_delete_doc_with_lock(&h.project, &h.doc, true)
        .await
        .unwrap();
    assert!(h.cache.is_empty().unwrap());
    assert_eq!(stored_version(&h).await, 0, "unflushed edit is lost");
    assert!(!h.is_locked().await);
}

#[tokio::test]
async fn test_flush_timeout_is_a_storage_error() {
    let config = UpdaterConfig {
        flush_timeout_ms: 20,
        ..UpdaterConfig::default()
    };
    let h = Harness::with_config(&["hello"], 0, config).await;
    insert(&h, 0, 0, ">").await;
    h.store.set_write_delay(Duration::from_millis(500));

    let err = h
        .manager
        .flush_doc_if_loaded_with_lock(&h.project, &h.doc)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "storage");
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn test_flush_and_delete_unknown_doc_is_noop() {
    let h = Harness::new(&["hello"], 0).await;
    let missing = DocId::new("never-loaded").unwrap();

    h.manager
        .flush_and_delete_doc_with_lock(&h.project, &missing, false)
        .await
        .unwrap();
    let flushed = h
        .manager
        .flush_doc_if_loaded_with_lock(&h.project, &missing)
        .await
        .unwrap();
    assert!(!flushed);
}

#[tokio::test]
async fn test_get_doc_and_flush_if_old() {
    let config = UpdaterConfig {
        max_unflushed_age_secs: 0,
        ..UpdaterConfig::default()
    };
    let h = Harness::with_config(&["hello"], 0, config).await;
    insert(&h, 0, 5, "?").await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let doc = h
        .manager
        .get_doc_and_flush_if_old_with_lock(&h.project, &h.doc)
        .await
        .unwrap();
    assert_eq!(doc.version, 1);
    assert_eq!(stored_version(&h).await, 1);
}

#[tokio::test]
async fn test_recent_changes_are_not_flushed_early() {
    let h = Harness::new(&["hello"], 0).await;
    insert(&h, 0, 5, "?").await;

    h.manager
        .get_doc_and_flush_if_old_with_lock(&h.project, &h.doc)
        .await
        .unwrap();
    assert_eq!(stored_version(&h).await, 0);
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn test_missing_document_is_not_found() {
    let h = Harness::new(&["hello"], 0).await;
    let missing = DocId::new("doc-404").unwrap();

    let err = h.manager.get_doc_with_lock(&h.project, &missing).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(!h.locks.is_locked(&missing).await.unwrap());
}

#[tokio::test]
async fn test_recent_ops_since_version() {
    let h = Harness::new(&[""], 0).await;
    for (v, text) in ["a", "b", "c"].into_iter().enumerate() {
        insert(&h, u64::try_from(v).unwrap(), v, text).await;
    }

    let (doc, ops) = h
        .manager
        .get_doc_and_recent_ops_with_lock(&h.project, &h.doc, Some(1))
        .await
        .unwrap();
    assert_eq!(doc.lines, owned(&["abc"]));
    assert_eq!(ops.iter().map(|u| u.v).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(ops[0].op, vec![Op::insert(1, "b")]);
    assert_eq!(ops[0].meta.doc_length, Some(1));
}

#[tokio::test]
async fn test_recent_ops_beyond_retention_are_unavailable() {
    let config = UpdaterConfig {
        doc_ops_max_length: 2,
        ..UpdaterConfig::default()
    };
    let h = Harness::with_config(&[""], 0, config).await;
    for v in 0..4_u64 {
        insert(&h, v, 0, "x").await;
    }

    let err = h
        .manager
        .get_doc_and_recent_ops_with_lock(&h.project, &h.doc, Some(0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ops_unavailable");
}

// ============================================================================
// Whole-document replacement
// ============================================================================

#[tokio::test]
async fn test_set_doc_on_loaded_doc_flushes_and_stays_cached() {
    let h = Harness::new(&["one", "two"], 4).await;
    h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();

    h.manager
        .set_doc_with_lock(
            &h.project,
            &h.doc,
            SetDocRequest::new(owned(&["one", "2", "three"]), "file-upload").with_user("dave"),
        )
        .await
        .unwrap();

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert!(doc.already_loaded);
    assert_eq!(doc.lines, owned(&["one", "2", "three"]));
    assert_eq!(doc.version, 5);
    assert!(doc.unflushed_time.is_none());

    let stored = h.store.get_doc(&h.project, &h.doc).await.unwrap();
    assert_eq!(stored.lines, owned(&["one", "2", "three"]));
    assert_eq!(stored.last_updated_by.as_deref(), Some("dave"));

    let recorded = h.history.recorded().unwrap();
    assert_eq!(recorded.len(), 1);
    let meta = &recorded[0].1.meta;
    assert_eq!(meta.kind.as_deref(), Some(EXTERNAL_UPDATE));
    assert_eq!(meta.source.as_deref(), Some("file-upload"));
    assert_eq!(meta.user_id.as_deref(), Some("dave"));
}

#[tokio::test]
async fn test_set_doc_on_unloaded_doc_evicts_again() {
    let h = Harness::new(&["draft"], 0).await;

    h.manager
        .set_doc_with_lock(&h.project, &h.doc, SetDocRequest::new(owned(&["final"]), "restore"))
        .await
        .unwrap();

    assert!(h.cache.is_empty().unwrap());
    let stored = h.store.get_doc(&h.project, &h.doc).await.unwrap();
    assert_eq!(stored.lines, owned(&["final"]));
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn test_set_doc_with_same_lines_keeps_version() {
    let h = Harness::new(&["same"], 9).await;

    h.manager
        .set_doc_with_lock(&h.project, &h.doc, SetDocRequest::new(owned(&["same"]), "noop"))
        .await
        .unwrap();

    assert_eq!(stored_version(&h).await, 9);
    assert!(h.history.recorded().unwrap().is_empty());
}

#[tokio::test]
async fn test_undoing_set_doc_restores_tracked_delete() {
    let h = Harness::new(&["hello world"], 0).await;
    let delete = Update::new(h.doc.clone(), 0, vec![Op::delete(6, "world")]).with_tracking("s1");
    h.manager.submit_update(&h.project, &h.doc, delete).await.unwrap();

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert_eq!(
        doc.ranges.changes[0].op,
        ChangeOp::Delete { p: 6, d: "world".into() }
    );

    h.manager
        .set_doc_with_lock(
            &h.project,
            &h.doc,
            SetDocRequest::new(owned(&["hello world"]), "undo").undoing(),
        )
        .await
        .unwrap();

    let doc = h.manager.get_doc_with_lock(&h.project, &h.doc).await.unwrap();
    assert_eq!(doc.lines, owned(&["hello world"]));
    assert!(doc.ranges.changes.is_empty(), "undo cancels the tracked delete");

    let recorded = h.history.recorded().unwrap();
    let undo = &recorded.last().unwrap().1;
    assert!(undo.op.iter().all(|op| matches!(op, Op::Insert { u: true, .. })));
}
