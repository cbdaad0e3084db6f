//! Tests for `src/pipeline/ledger.rs`.

use callsift::checkpoint::{CallState, CallStatus, CheckpointStore, StateMap};
use callsift::config::RemovedPolicy;
use callsift::pipeline::{Ledger, PipelineError};
use callsift::transcript::{SourceSnapshot, TranscriptRecord};
use serde_json::json;

fn record(id: &str, text: &str) -> TranscriptRecord {
    TranscriptRecord {
        call_id: id.to_owned(),
        transcript: text.to_owned(),
        customer_name: None,
        phone_numbers: Vec::new(),
        case_ids: Vec::new(),
    }
}

fn snapshot(records: Vec<TranscriptRecord>) -> SourceSnapshot {
    match SourceSnapshot::from_records(records) {
        Ok(s) => s,
        Err(err) => panic!("snapshot should build: {err}"),
    }
}

#[tokio::test]
async fn apply_changes_adds_pending_calls_and_commits() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = CheckpointStore::new(tmp.path().join("out.json"));
    let ledger = Ledger::new(store.clone(), StateMap::new());

    let snap = snapshot(vec![record("CALL-1", "a"), record("CALL-2", "b")]);
    let changes = snap.diff(&ledger.snapshot().await);
    ledger
        .apply_changes(&snap, &changes, RemovedPolicy::Retain)
        .await
        .expect("apply");

    let on_disk = store.load().expect("load");
    assert_eq!(on_disk.states.len(), 2);
    assert!(on_disk
        .states
        .values()
        .all(|s| s.status == CallStatus::Pending));
    assert_eq!(
        on_disk.states["CALL-1"].source_digest.as_deref(),
        snap.digest("CALL-1")
    );
}

#[tokio::test]
async fn apply_changes_resets_modified_calls() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = CheckpointStore::new(tmp.path().join("out.json"));

    let old = record("CALL-1", "old text");
    let mut state = CallState::pending("CALL-1", old.digest());
    state.complete(json!({"summary": "old"}));
    let ledger = Ledger::new(store, StateMap::from([("CALL-1".to_owned(), state)]));

    let snap = snapshot(vec![record("CALL-1", "new text")]);
    let changes = snap.diff(&ledger.snapshot().await);
    assert!(changes.modified.contains("CALL-1"));
    ledger
        .apply_changes(&snap, &changes, RemovedPolicy::Retain)
        .await
        .expect("apply");

    let states = ledger.snapshot().await;
    assert_eq!(states["CALL-1"].status, CallStatus::Pending);
    assert!(states["CALL-1"].result.is_none());
}

#[tokio::test]
async fn commit_outcome_persists_immediately() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = CheckpointStore::new(tmp.path().join("out.json"));
    let states = StateMap::from([("CALL-1".to_owned(), CallState::pending("CALL-1", "d"))]);
    let ledger = Ledger::new(store.clone(), states);

    ledger
        .commit_outcome("CALL-1", |s| s.complete(json!({"summary": "ok"})))
        .await
        .expect("commit");

    let on_disk = store.load().expect("load");
    assert_eq!(on_disk.states["CALL-1"].status, CallStatus::Done);
}

#[tokio::test]
async fn mark_does_not_touch_disk() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = CheckpointStore::new(tmp.path().join("out.json"));
    let states = StateMap::from([("CALL-1".to_owned(), CallState::pending("CALL-1", "d"))]);
    let ledger = Ledger::new(store.clone(), states);

    assert!(ledger.mark("CALL-1", CallState::begin_attempt).await);
    assert!(!ledger.mark("CALL-404", CallState::begin_attempt).await);
    assert!(!store.primary_path().exists());
    assert_eq!(
        ledger.snapshot().await["CALL-1"].status,
        CallStatus::InFlight
    );
}

#[tokio::test]
async fn commit_outcome_for_unknown_call_is_an_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let ledger = Ledger::new(
        CheckpointStore::new(tmp.path().join("out.json")),
        StateMap::new(),
    );

    let result = ledger
        .commit_outcome("CALL-404", |s| s.complete(json!({})))
        .await;
    assert!(matches!(result, Err(PipelineError::UnknownCall(id)) if id == "CALL-404"));
}
