#![cfg(feature = "test-utils")]

mod common;

use relay::clients::event_stream::EventStreamTarget;
use relay::clock::Clock;
use relay::context::RunContext;
use relay::delivery::router::{DeliveryRouter, SinkTarget};
use relay::delivery::schema::SchemaRegistry;
use relay::error::ErrorKind;
use relay::query::catalog::VersionedCatalog;
use relay::test_utils::fixtures::{query, record, utc};
use relay::types::{CycleOutcome, Record, TableSpec};
use relay::workers::activity::TableProcessor;
use relay_config::shared::RetryConfig;
use relay_telemetry::tracing::init_test_tracing;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use common::{TestRelay, run_config};

fn retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_factor: 2.0,
    }
}

#[tokio::test]
async fn window_is_closed_at_the_start_and_open_at_the_end() {
    init_test_tracing();
    let relay = TestRelay::new()
        .with_catalog(VersionedCatalog::default().with_query("Orders", query("all", "Orders")));
    let checkpoints = relay.checkpoints();
    checkpoints.initialize().await.unwrap();
    checkpoints
        .commit("Orders", utc("2024-05-01T08:00:00Z"))
        .await
        .unwrap();
    for (id, at) in [
        (1, "2024-05-01T07:59:59.999Z"),
        (2, "2024-05-01T08:00:00Z"),
        (3, "2024-05-01T08:04:59.999Z"),
        (4, "2024-05-01T08:05:00Z"),
    ] {
        relay
            .analytics
            .ingest("Orders", utc(at), record(json!({"Id": id})))
            .await;
    }

    let queue = relay.queue();
    queue.initialize().await.unwrap();
    queue
        .seed(&[TableSpec::new("Orders", "sink-test")], relay.clock.now())
        .await
        .unwrap();
    let entry = queue
        .claim_next("run", relay.clock.now())
        .await
        .unwrap()
        .unwrap();

    let activity = relay.activity(Arc::new(run_config(1)));
    activity.prepare().await.unwrap();
    let ctx = RunContext::new("run", utc("2024-05-01T08:14:00Z"));
    let result = activity
        .process(&ctx, &entry, utc("2024-05-01T08:13:00Z"))
        .await
        .unwrap();

    assert_eq!(result.outcome, CycleOutcome::Completed);
    assert_eq!(result.records_sent, 2);
    assert_eq!(
        relay.log_ingestion.records_for("Custom-Orders").await,
        vec![record(json!({"Id": 2})), record(json!({"Id": 3}))]
    );

    let executed = relay.analytics.executed().await;
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("datetime(2024-05-01T08:00:00.000Z)"));
    assert!(executed[0].contains("datetime(2024-05-01T08:05:00.000Z)"));
}

#[tokio::test]
async fn event_stream_messages_stay_within_the_chunk_size() {
    init_test_tracing();
    let relay = TestRelay::new();
    let chunk_bytes = 256;
    let router = DeliveryRouter::new(
        relay.log_ingestion.clone(),
        relay.event_stream.clone(),
        SchemaRegistry::default(),
        retry(1),
        relay.clock(),
    )
    .with_chunk_bytes(chunk_bytes);
    let records = (0..40)
        .map(|id| record(json!({"Id": id, "Payload": "x".repeat(20)})))
        .collect::<Vec<_>>();
    let target = SinkTarget::EventStream(EventStreamTarget::new("relay-ns", "orders"));

    let report = router
        .deliver("Orders", records.clone(), &target, utc("2024-05-01T08:13:00Z"))
        .await;

    assert!(report.all_delivered());
    assert_eq!(report.sent, 40);

    let messages = relay.event_stream.messages().await;
    assert!(messages.len() > 1);
    let mut delivered = Vec::new();
    for (message_target, payload) in messages {
        assert_eq!(message_target.name, "orders");
        assert!(payload.len() <= chunk_bytes);
        delivered.extend(serde_json::from_str::<Vec<Record>>(&payload).unwrap());
    }
    // Order and content survive the split.
    assert_eq!(delivered, records);
}

#[tokio::test]
async fn transient_sink_failures_are_retried() {
    init_test_tracing();
    let relay = TestRelay::new();
    relay
        .event_stream
        .fail_next(2, ErrorKind::ServiceUnavailable)
        .await;
    let router = DeliveryRouter::new(
        relay.log_ingestion.clone(),
        relay.event_stream.clone(),
        SchemaRegistry::default(),
        retry(3),
        relay.clock(),
    );
    let target = SinkTarget::EventStream(EventStreamTarget::new("relay-ns", "orders"));

    let report = router
        .deliver(
            "Orders",
            vec![record(json!({"Id": 1}))],
            &target,
            utc("2024-05-01T08:13:00Z"),
        )
        .await;

    assert!(report.all_delivered());
    assert_eq!(relay.event_stream.attempts().await, 3);
    assert_eq!(relay.event_stream.messages().await.len(), 1);
}

#[tokio::test]
async fn terminal_sink_failures_are_not_retried() {
    init_test_tracing();
    let relay = TestRelay::new();
    relay
        .log_ingestion
        .fail_next(1, ErrorKind::SinkConfigurationError)
        .await;
    let router = DeliveryRouter::new(
        relay.log_ingestion.clone(),
        relay.event_stream.clone(),
        SchemaRegistry::default(),
        retry(3),
        relay.clock(),
    );
    let target = SinkTarget::LogIngestion(
        relay::clients::log_ingestion::LogIngestionTarget::for_table(
            "https://dce.example.com",
            "dcr-test",
            "Orders",
        ),
    );

    let report = router
        .deliver(
            "Orders",
            vec![record(json!({"Id": 1})), record(json!({"Id": 2}))],
            &target,
            utc("2024-05-01T08:13:00Z"),
        )
        .await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(report.errors[0].kind(), ErrorKind::SinkConfigurationError);
    assert_eq!(relay.log_ingestion.attempts().await, 2);
}

#[tokio::test]
async fn log_ingestion_records_are_trimmed_to_the_table_schema() {
    init_test_tracing();
    let relay = TestRelay::new();
    let schemas = SchemaRegistry::new(BTreeMap::from([(
        "Orders".to_owned(),
        vec!["Id".to_owned(), "Amount".to_owned()],
    )]));
    let router = DeliveryRouter::new(
        relay.log_ingestion.clone(),
        relay.event_stream.clone(),
        schemas,
        retry(1),
        relay.clock(),
    );
    let target = SinkTarget::LogIngestion(
        relay::clients::log_ingestion::LogIngestionTarget::for_table(
            "https://dce.example.com",
            "dcr-test",
            "Orders",
        ),
    );

    let report = router
        .deliver(
            "Orders",
            vec![
                record(json!({"Id": 1, "Amount": 9.5, "Extra": true, "TenantId": "t"})),
                record(json!({"Extra": false, "_ResourceId": "r"})),
            ],
            &target,
            utc("2024-05-01T08:13:00Z"),
        )
        .await;

    assert_eq!(report.sent, 1);
    assert_eq!(report.skipped, 1);
    assert!(report.all_delivered());
    assert_eq!(
        relay.log_ingestion.records_for("Custom-Orders").await,
        vec![record(json!({"Id": 1, "Amount": 9.5}))]
    );
}
