//! Integration tests for recording occurrences and reading merged views.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::fixtures::{self, labels, STACK_TRACE, STACK_TRACE_BLANK_LINE};
use common::{config_with_shards, TestBoard};
use crashboard_core::model::logical_name;
use crashboard_core::{
    fingerprint, AttributeDelta, CrashState, CrashboardError, FieldValue, RecentField,
};
use crashboard_state::CacheBackend;
use rstest::{fixture, rstest};
use serde_json::json;

#[fixture]
fn board() -> TestBoard {
    TestBoard::new()
}

#[rstest]
#[tokio::test]
async fn same_report_twice_counts_two(board: TestBoard) {
    board.board.record(STACK_TRACE, &[], &[]).await.unwrap();
    let view = board.board.record(STACK_TRACE, &[], &[]).await.unwrap().unwrap();

    assert_eq!(view.count, 2);
    assert_eq!(view.fingerprint, fingerprint(STACK_TRACE).unwrap());
    assert_eq!(view.text, STACK_TRACE);
    assert_eq!(view.state, CrashState::Unresolved);

    // An extra blank line does not change the crash.
    let view = board
        .board
        .record(STACK_TRACE_BLANK_LINE, &[], &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.fingerprint, fingerprint(STACK_TRACE).unwrap());
    assert_eq!(view.count, 3);
}

#[rstest]
#[case("")]
#[case("   ")]
#[case("\n\r\n\t")]
#[tokio::test]
async fn blank_reports_are_not_recorded(board: TestBoard, #[case] text: &str) {
    assert!(board.board.record(text, &[], &[]).await.unwrap().is_none());
    assert!(board.kv.is_empty().await);
}

#[rstest]
#[tokio::test]
async fn surrounding_whitespace_is_trimmed(board: TestBoard) {
    let view = board
        .board
        .record("\n\n  Error: X\n at foo\n at bar  \n", &[], &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.text, STACK_TRACE);
}

#[rstest]
#[tokio::test]
async fn labels_and_argv_come_from_creation(board: TestBoard) {
    let argv = labels(&["t2", "push", "index.js"]);
    let view = board
        .board
        .record(fixtures::USB_FAULT, &labels(&["linux", "cli"]), &argv)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(view.labels, vec!["linux", "cli"]);
    assert_eq!(view.argv, argv);
    assert!(view.timestamp > 0);
    assert!(view.key.starts_with(&logical_name(view.fingerprint)));
}

#[tokio::test]
async fn concurrent_writers_on_distinct_shards_are_all_counted() {
    let board = Arc::new(TestBoard::sequential(config_with_shards(20)));
    let writers = 16;

    let tasks: Vec<_> = (0..writers)
        .map(|_| {
            let board = board.clone();
            tokio::spawn(async move { board.board.record(STACK_TRACE, &[], &[]).await })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let name = logical_name(fingerprint(STACK_TRACE).unwrap());
    board.board.clear_cache(fingerprint(STACK_TRACE).unwrap()).await;
    assert_eq!(board.board.counter().count(&name).await.unwrap(), writers);
    assert_eq!(
        board.board.counter().shard_records(&name).await.unwrap().len(),
        writers as usize
    );
}

#[tokio::test]
async fn issue_is_readable_across_shards() {
    let board = TestBoard::sequential(config_with_shards(4));
    for _ in 0..4 {
        board.board.record(STACK_TRACE, &[], &[]).await.unwrap();
    }
    let fp = fingerprint(STACK_TRACE).unwrap();
    let name = logical_name(fp);
    assert_eq!(board.board.counter().shard_records(&name).await.unwrap().len(), 4);

    let view = board
        .board
        .update_attributes(fp, &AttributeDelta::issue("42"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.issue.as_deref(), Some("42"));

    assert_eq!(
        board
            .board
            .counter()
            .most_recent(&name, RecentField::Issue)
            .await
            .unwrap(),
        FieldValue::Issue(Some("42".to_string()))
    );
    for record in board.board.counter().shard_records(&name).await.unwrap() {
        assert_eq!(record.issue.as_deref(), Some("42"));
    }
}

#[tokio::test]
async fn new_shards_inherit_existing_issue() {
    let board = TestBoard::sequential(config_with_shards(3));
    let fp = fingerprint(STACK_TRACE).unwrap();
    board.board.record(STACK_TRACE, &[], &[]).await.unwrap();
    board.board.update_issue(fp, "7").await.unwrap();

    // Lands on a fresh shard.
    board.board.record(STACK_TRACE, &[], &[]).await.unwrap();

    let records = board
        .board
        .counter()
        .shard_records(&logical_name(fp))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.issue.as_deref() == Some("7")));
}

#[rstest]
#[tokio::test]
async fn update_of_unknown_crash_returns_none(board: TestBoard) {
    let fp = fingerprint("never recorded").unwrap();
    let updated = board
        .board
        .update_state(fp, CrashState::Resolved)
        .await
        .unwrap();
    assert!(updated.is_none());
    assert!(board.board.get_crash(fp).await.unwrap().is_none());
}

#[rstest]
#[tokio::test]
async fn update_applies_all_fields(board: TestBoard) {
    let view = board.board.record(STACK_TRACE, &[], &[]).await.unwrap().unwrap();

    let delta = AttributeDelta::from_pairs([
        ("state", json!("submitted")),
        ("labels", json!(["triaged"])),
        ("date_time", json!(1_700_000_000_000_i64)),
    ])
    .unwrap();
    let updated = board
        .board
        .update_attributes(view.fingerprint, &delta)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.state, CrashState::Submitted);
    assert_eq!(updated.labels, vec!["triaged"]);
    assert_eq!(updated.timestamp, 1_700_000_000_000);
    assert_eq!(updated.count, 1);
}

#[test]
fn unknown_attribute_is_rejected() {
    let err = AttributeDelta::from_pairs([("satte", json!("resolved"))]).unwrap_err();
    assert!(matches!(err, CrashboardError::UnknownField(_)));
}

#[rstest]
#[tokio::test]
async fn invalidate_twice_matches_once(board: TestBoard) {
    board.board.record(STACK_TRACE, &[], &[]).await.unwrap();
    let fp = fingerprint(STACK_TRACE).unwrap();
    let name = logical_name(fp);

    let before = board.board.get_crash(fp).await.unwrap().unwrap();
    board.board.clear_cache(fp).await;
    let once = board.board.get_crash(fp).await.unwrap().unwrap();
    board.board.clear_cache(fp).await;
    board.board.clear_cache(fp).await;
    let twice = board.board.get_crash(fp).await.unwrap().unwrap();

    assert_eq!(before, once);
    assert_eq!(once, twice);

    // A stale cached total is corrected by invalidation.
    board
        .cache
        .set(&format!("total/{}", name), b"1000", None)
        .await
        .unwrap();
    assert_eq!(board.board.counter().count(&name).await.unwrap(), 1000);
    board.board.counter().invalidate(&name).await;
    assert_eq!(board.board.counter().count(&name).await.unwrap(), 1);
}

#[rstest]
#[tokio::test]
async fn remove_decrements_count(board: TestBoard) {
    for _ in 0..5 {
        board.board.record(STACK_TRACE, &[], &[]).await.unwrap();
    }
    let view = board.board.remove(STACK_TRACE, 2).await.unwrap().unwrap();
    assert_eq!(view.count, 3);

    assert!(board.board.remove("   ", 1).await.unwrap().is_none());
}

#[rstest]
#[tokio::test]
async fn cache_outage_does_not_lose_counts(board: TestBoard) {
    board.board.record(STACK_TRACE, &[], &[]).await.unwrap();
    board.cache.flush().await;
    let view = board.board.record(STACK_TRACE, &[], &[]).await.unwrap().unwrap();
    assert_eq!(view.count, 2);
}
