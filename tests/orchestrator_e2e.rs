// tests/orchestrator_e2e.rs
mod common;

use common::*;
use std::sync::Arc;

use keyword_relay::config::{CheckerSlot, CursorPolicy, UserConfig};
use keyword_relay::notify::RecordingTransport;
use keyword_relay::{ConfigHandle, CursorKey, CursorStore, Dispatcher, Orchestrator, SnapshotCache};

struct Harness {
    orch: Orchestrator,
    transport: Arc<RecordingTransport>,
}

fn harness(users: Vec<UserConfig>, cursors: CursorStore, discourse: Arc<FakeDiscourse>) -> Harness {
    harness_with(
        users,
        cursors,
        discourse,
        Arc::new(FakeStackExchange::default()),
        Arc::new(RecordingTransport::new()),
    )
}

fn harness_with(
    users: Vec<UserConfig>,
    cursors: CursorStore,
    discourse: Arc<FakeDiscourse>,
    stackexchange: Arc<FakeStackExchange>,
    transport: Arc<RecordingTransport>,
) -> Harness {
    let orch = Orchestrator::new(
        ConfigHandle::new(users),
        sources(discourse, stackexchange, Arc::new(FakeGovernance::default())),
        Dispatcher::new(transport.clone()),
        cursors,
        SnapshotCache::in_memory(),
    );
    Harness { orch, transport }
}

fn alice_key() -> CursorKey {
    CursorKey::new("alice", "discourse")
}

async fn cursors_at(key: &CursorKey, at: chrono::DateTime<chrono::Utc>) -> CursorStore {
    let mut store = CursorStore::in_memory();
    store.set(key, at).await.unwrap();
    store
}

fn security_forum() -> Arc<FakeDiscourse> {
    Arc::new(FakeDiscourse::with_posts(
        "security",
        vec![post(42, "carol", "Critical security patch released", ts(2024, 1, 2))],
    ))
}

#[tokio::test]
async fn new_forum_post_is_relayed_exactly_once() {
    let discourse = security_forum();
    let mut h = harness(
        vec![user("alice", vec![discourse_slot(&["security"])])],
        cursors_at(&alice_key(), ts(2024, 1, 1)).await,
        discourse.clone(),
    );

    let first = h.orch.run_tick(ts(2024, 1, 3)).await;
    assert_eq!(first.delivered, 1);
    assert_eq!(first.checkers_run, 1);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "!alice-room:example.org");
    assert_eq!(
        sent[0].1.body,
        "carol - Critical security patch released\nhttps://forum.example.org/t/42/1"
    );
    assert_eq!(h.orch.cursors().peek(&alice_key()), Some(ts(2024, 1, 3)));

    // Same source data, later tick: nothing new to say.
    let second = h.orch.run_tick(ts(2024, 1, 4)).await;
    assert_eq!(second.delivered, 0);
    assert_eq!(h.transport.sent().len(), 1);
    assert_eq!(h.orch.cursors().peek(&alice_key()), Some(ts(2024, 1, 4)));

    assert_eq!(
        discourse.queries(),
        vec![
            "security after:2024-01-01 in:open".to_string(),
            "security after:2024-01-03 in:open".to_string(),
        ]
    );
}

#[tokio::test]
async fn first_run_only_sets_the_cursor() {
    let mut h = harness(
        vec![user("alice", vec![discourse_slot(&["security"])])],
        CursorStore::in_memory(),
        security_forum(),
    );

    let report = h.orch.run_tick(ts(2024, 6, 1)).await;
    assert_eq!(report.delivered, 0);
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.orch.cursors().peek(&alice_key()), Some(ts(2024, 6, 1)));
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let mut h = harness(
        vec![user("alice", vec![discourse_slot(&["security"])])],
        cursors_at(&alice_key(), ts(2024, 5, 1)).await,
        security_forum(),
    );

    h.orch.run_tick(ts(2024, 4, 1)).await;
    assert_eq!(h.orch.cursors().peek(&alice_key()), Some(ts(2024, 5, 1)));
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn failed_fetch_still_advances_cursor_by_default() {
    let discourse = security_forum();
    discourse.fail_keyword("security");
    let mut h = harness(
        vec![user("alice", vec![discourse_slot(&["security"])])],
        cursors_at(&alice_key(), ts(2024, 1, 1)).await,
        discourse.clone(),
    );

    let report = h.orch.run_tick(ts(2024, 1, 3)).await;
    assert_eq!(report.checker_errors, 1);
    assert_eq!(h.orch.cursors().peek(&alice_key()), Some(ts(2024, 1, 3)));

    // The post from the failed window is not recovered.
    discourse.heal();
    let report = h.orch.run_tick(ts(2024, 1, 4)).await;
    assert_eq!(report.delivered, 0);
}

#[tokio::test]
async fn hold_on_failure_rescans_the_window() {
    let discourse = security_forum();
    discourse.fail_keyword("security");
    let mut h = harness(
        vec![user("alice", vec![discourse_slot(&["security"])])],
        cursors_at(&alice_key(), ts(2024, 1, 1)).await,
        discourse.clone(),
    );
    h.orch = h.orch.with_policy(CursorPolicy::HoldOnFailure);

    let report = h.orch.run_tick(ts(2024, 1, 3)).await;
    assert_eq!(report.checker_errors, 1);
    assert_eq!(h.orch.cursors().peek(&alice_key()), Some(ts(2024, 1, 1)));

    discourse.heal();
    let report = h.orch.run_tick(ts(2024, 1, 4)).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(h.orch.cursors().peek(&alice_key()), Some(ts(2024, 1, 4)));
}

#[tokio::test]
async fn broken_checkers_do_not_block_the_rest() {
    let discourse = security_forum();
    discourse.fail_keyword("security");
    let stackexchange = Arc::new(FakeStackExchange::with_question(
        "runtime",
        "Runtime upgrade stuck at &quot;enacted&quot;",
        "https://substrate.stackexchange.com/q/9001",
        ts(2024, 1, 2),
    ));
    let alice = user(
        "alice",
        vec![
            CheckerSlot::Invalid {
                checker_type: "twitter".into(),
                reason: "unknown variant `twitter`".into(),
            },
            discourse_slot(&["security"]),
            stackexchange_slot(&["runtime"]),
        ],
    );
    let mut cursors = cursors_at(&alice_key(), ts(2024, 1, 1)).await;
    cursors
        .set(&CursorKey::new("alice", "stackexchange"), ts(2024, 1, 1))
        .await
        .unwrap();
    let mut h = harness_with(
        vec![alice],
        cursors,
        discourse,
        stackexchange,
        Arc::new(RecordingTransport::new()),
    );

    let report = h.orch.run_tick(ts(2024, 1, 3)).await;
    assert_eq!(report.checkers_skipped, 1);
    assert_eq!(report.checkers_run, 2);
    assert_eq!(report.checker_errors, 1);
    assert_eq!(report.delivered, 1);

    let sent = h.transport.sent();
    assert_eq!(
        sent[0].1.body,
        "dave - Runtime upgrade stuck at \"enacted\"\nhttps://substrate.stackexchange.com/q/9001"
    );
}

#[tokio::test]
async fn failed_delivery_does_not_hold_back_the_cursor() {
    let discourse = Arc::new(FakeDiscourse::with_posts(
        "security",
        vec![
            post(42, "carol", "security patch one", ts(2024, 1, 2)),
            post(43, "erin", "security patch two", ts(2024, 1, 2)),
        ],
    ));
    let mut h = harness_with(
        vec![user("alice", vec![discourse_slot(&["security"])])],
        cursors_at(&alice_key(), ts(2024, 1, 1)).await,
        discourse,
        Arc::new(FakeStackExchange::default()),
        Arc::new(RecordingTransport::failing_on(vec![0])),
    );

    let report = h.orch.run_tick(ts(2024, 1, 3)).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.delivery_failures, 1);
    assert_eq!(h.transport.attempts(), 2);
    assert!(h.transport.sent()[0].1.body.starts_with("erin - "));
    assert_eq!(h.orch.cursors().peek(&alice_key()), Some(ts(2024, 1, 3)));
}

#[tokio::test]
async fn users_get_their_own_rooms_and_cursors() {
    let discourse = security_forum();
    let mut h = harness(
        vec![
            user("alice", vec![discourse_slot(&["security"])]),
            user("bob", vec![discourse_slot(&["security"])]),
        ],
        cursors_at(&alice_key(), ts(2024, 1, 1)).await,
        discourse,
    );

    let report = h.orch.run_tick(ts(2024, 1, 3)).await;
    // Bob's cursor starts at this tick, so only Alice hears about the post.
    assert_eq!(report.delivered, 1);
    assert_eq!(h.transport.sent()[0].0, "!alice-room:example.org");
    assert_eq!(
        h.orch.cursors().peek(&CursorKey::new("bob", "discourse")),
        Some(ts(2024, 1, 3))
    );
}
