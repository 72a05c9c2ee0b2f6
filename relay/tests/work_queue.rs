#![cfg(feature = "test-utils")]

mod common;

use chrono::TimeDelta;
use relay::clock::Clock;
use relay::store::queue::Release;
use relay::test_utils::fixtures::utc;
use relay::types::{QueueStatus, TableSpec};
use relay_telemetry::tracing::init_test_tracing;

use common::TestRelay;

fn tables(names: &[&str]) -> Vec<TableSpec> {
    names
        .iter()
        .map(|name| TableSpec::new(*name, "sink-test"))
        .collect()
}

#[tokio::test]
async fn concurrent_claims_hand_out_an_entry_once() {
    init_test_tracing();
    let relay = TestRelay::new();
    let queue = relay.queue();
    queue.initialize().await.unwrap();
    queue.seed(&tables(&["Orders"]), relay.clock.now()).await.unwrap();

    let other = relay.queue();
    let now = relay.clock.now();
    let (first, second) = tokio::join!(
        queue.claim_next("run-1", now),
        other.claim_next("run-2", now)
    );

    let claimed = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, QueueStatus::Processing);

    let stored = queue.entries().await.unwrap();
    assert_eq!(stored[0].processing_owner, claimed[0].processing_owner);
}

#[tokio::test]
async fn rotation_prefers_the_least_recently_processed_table() {
    init_test_tracing();
    let relay = TestRelay::new();
    let queue = relay.queue();
    queue.initialize().await.unwrap();
    queue
        .seed(&tables(&["A", "B", "C"]), relay.clock.now())
        .await
        .unwrap();

    let mut order = Vec::new();
    for _ in 0..4 {
        relay.clock.advance(TimeDelta::seconds(1));
        let entry = queue
            .claim_next("run", relay.clock.now())
            .await
            .unwrap()
            .unwrap();
        order.push(entry.table_name.clone());
        queue
            .release(entry, Release::Succeeded, relay.clock.now())
            .await
            .unwrap();
    }

    assert_eq!(order, vec!["A", "B", "C", "A"]);
}

#[tokio::test]
async fn reseeding_resets_stuck_entries_and_keeps_the_rotation() {
    init_test_tracing();
    let relay = TestRelay::new();
    let queue = relay.queue();
    queue.initialize().await.unwrap();
    queue
        .seed(&tables(&["A", "B"]), utc("2024-05-01T08:00:00Z"))
        .await
        .unwrap();

    // A is processed, then B is claimed by a run that never releases it.
    let a = queue
        .claim_next("run-1", utc("2024-05-01T08:01:00Z"))
        .await
        .unwrap()
        .unwrap();
    queue
        .release(a, Release::Failed, utc("2024-05-01T08:02:00Z"))
        .await
        .unwrap();
    let b = queue
        .claim_next("run-1", utc("2024-05-01T08:03:00Z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.table_name, "B");

    let seeded = queue
        .seed(&tables(&["A", "B"]), utc("2024-05-01T08:10:00Z"))
        .await
        .unwrap();
    let again = queue
        .seed(&tables(&["A", "B"]), utc("2024-05-01T08:10:00Z"))
        .await
        .unwrap();
    assert_eq!(seeded, 2);
    assert_eq!(again, 2);

    let entries = queue.entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(entry.status, QueueStatus::Available);
        assert_eq!(entry.processing_owner, None);
    }
    assert_eq!(
        entries[0].last_processed_at,
        Some(utc("2024-05-01T08:02:00Z"))
    );
    assert_eq!(entries[1].last_processed_at, None);

    // B was never processed, so it comes first.
    let next = queue
        .claim_next("run-2", utc("2024-05-01T08:11:00Z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.table_name, "B");
}

#[tokio::test]
async fn deferred_release_keeps_the_table_at_the_front() {
    init_test_tracing();
    let relay = TestRelay::new();
    let queue = relay.queue();
    queue.initialize().await.unwrap();
    queue
        .seed(&tables(&["A", "B"]), relay.clock.now())
        .await
        .unwrap();

    let a = queue
        .claim_next("run", relay.clock.now())
        .await
        .unwrap()
        .unwrap();
    queue
        .release(a, Release::Deferred, relay.clock.now())
        .await
        .unwrap();

    let next = queue
        .claim_next("run", relay.clock.now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.table_name, "A");
}
