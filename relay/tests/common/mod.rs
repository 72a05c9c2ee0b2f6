//! Shared wiring for the relay integration tests.
//!
//! Everything runs in process: the key-value store, the analytical store and both sinks are the
//! in-memory test doubles, and time is a manual clock that only moves when a test moves it.

#![allow(dead_code)]

use relay::clock::{Clock, ManualClock};
use relay::delivery::router::DeliveryRouter;
use relay::delivery::schema::SchemaRegistry;
use relay::query::catalog::VersionedCatalog;
use relay::store::checkpoint::CheckpointStore;
use relay::store::memory::MemoryKeyValueStore;
use relay::store::queue::WorkQueueStore;
use relay::store::resilient::ResilientClient;
use relay::supervisor::Supervisor;
use relay::test_utils::analytics::MemoryAnalyticsStore;
use relay::test_utils::fixtures::utc;
use relay::test_utils::sinks::{RecordingEventStream, RecordingLogIngestion};
use relay::types::TableSpec;
use relay::workers::activity::TableProcessingActivity;
use relay_config::shared::{LogIngestionConfig, RetryConfig, RunConfig, SinkConfig};
use std::sync::Arc;

pub const QUEUE_TABLE: &str = "relayqueue";
pub const CHECKPOINT_TABLE: &str = "relaycheckpoints";

pub type Activity = TableProcessingActivity<
    MemoryAnalyticsStore,
    VersionedCatalog,
    RecordingLogIngestion,
    RecordingEventStream,
    MemoryKeyValueStore,
>;

pub type TestSupervisor = Supervisor<MemoryKeyValueStore, Activity, MemoryAnalyticsStore>;

/// Collaborators of one relay, kept so tests can seed inputs and inspect outputs.
pub struct TestRelay {
    pub clock: ManualClock,
    pub store: MemoryKeyValueStore,
    pub analytics: MemoryAnalyticsStore,
    pub log_ingestion: RecordingLogIngestion,
    pub event_stream: RecordingEventStream,
    pub catalog: VersionedCatalog,
    pub sink: SinkConfig,
}

impl TestRelay {
    /// A relay at 2024-05-01T08:05:00Z delivering through log ingestion.
    pub fn new() -> Self {
        Self {
            clock: ManualClock::new(utc("2024-05-01T08:05:00Z")),
            store: MemoryKeyValueStore::new(),
            analytics: MemoryAnalyticsStore::new(),
            log_ingestion: RecordingLogIngestion::new(),
            event_stream: RecordingEventStream::new(),
            catalog: VersionedCatalog::default(),
            sink: SinkConfig {
                log_ingestion: Some(LogIngestionConfig {
                    endpoint: Some("https://dce.example.com".to_owned()),
                    rule_id: Some("dcr-test".to_owned()),
                }),
                event_stream: None,
            },
        }
    }

    pub fn with_catalog(mut self, catalog: VersionedCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    fn client(&self) -> ResilientClient<MemoryKeyValueStore> {
        ResilientClient::new(
            self.store.clone(),
            RetryConfig {
                max_attempts: 2,
                initial_delay_ms: 1,
                max_delay_ms: 1,
                backoff_factor: 1.0,
            },
        )
    }

    pub fn queue(&self) -> WorkQueueStore<MemoryKeyValueStore> {
        WorkQueueStore::new(self.client(), QUEUE_TABLE)
    }

    pub fn checkpoints(&self) -> CheckpointStore<MemoryKeyValueStore> {
        CheckpointStore::new(self.client(), CHECKPOINT_TABLE)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    pub fn activity(&self, config: Arc<RunConfig>) -> Activity {
        let router = DeliveryRouter::new(
            self.log_ingestion.clone(),
            self.event_stream.clone(),
            SchemaRegistry::default(),
            RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
            self.clock(),
        );

        TableProcessingActivity::new(
            config,
            Arc::new(self.sink.clone()),
            self.analytics.clone(),
            self.catalog.clone(),
            router,
            self.checkpoints(),
            self.clock(),
        )
    }

    pub fn supervisor(&self, config: RunConfig, tables: &[&str]) -> TestSupervisor {
        let config = Arc::new(config);
        let tables = tables
            .iter()
            .map(|table| TableSpec::new(*table, "sink-test"))
            .collect();

        Supervisor::new(
            config.clone(),
            tables,
            self.queue(),
            self.activity(config),
            self.analytics.clone(),
            self.clock(),
        )
    }
}

/// Run options that keep a test run short and deterministic.
pub fn run_config(max_cycles: u64) -> RunConfig {
    RunConfig {
        max_cycles,
        health_check_interval: 0,
        queue_poll_interval_ms: 0,
        ..RunConfig::default()
    }
}
