use chrono::{DateTime, Utc};
use metrics::counter;
use relay_config::shared::{RetryConfig, SinkConfig};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bail;
use crate::clients::event_stream::{EventStreamClient, EventStreamTarget};
use crate::clients::log_ingestion::{LogIngestionClient, LogIngestionTarget};
use crate::clock::Clock;
use crate::delivery::chunking::{Chunk, DEFAULT_CHUNK_BYTES, chunk_records};
use crate::delivery::schema::SchemaRegistry;
use crate::error::{ErrorKind, RelayError, RelayResult};
use crate::metrics::{DESTINATION, RELAY_RECORDS_FAILED_TOTAL, RELAY_RECORDS_SENT_TOTAL, TABLE};
use crate::types::{DestinationKind, Record};

/// The one sink the records of a table go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    LogIngestion(LogIngestionTarget),
    EventStream(EventStreamTarget),
}

impl SinkTarget {
    pub fn kind(&self) -> DestinationKind {
        match self {
            SinkTarget::LogIngestion(_) => DestinationKind::LogIngestion,
            SinkTarget::EventStream(_) => DestinationKind::EventStream,
        }
    }
}

/// Picks the sink of `table`. A configured event stream always wins over log ingestion.
///
/// The error names the missing setting.
pub fn resolve_sink(config: &SinkConfig, table: &str) -> Result<SinkTarget, String> {
    if let Some(stream) = &config.event_stream {
        let namespace = non_empty(&stream.namespace)
            .ok_or_else(|| "event stream sink has no namespace".to_owned())?;
        let name =
            non_empty(&stream.name).ok_or_else(|| "event stream sink has no name".to_owned())?;

        return Ok(SinkTarget::EventStream(EventStreamTarget::new(namespace, name)));
    }

    if let Some(ingestion) = &config.log_ingestion {
        let endpoint = non_empty(&ingestion.endpoint)
            .ok_or_else(|| "log ingestion sink has no endpoint".to_owned())?;
        let rule_id = non_empty(&ingestion.rule_id)
            .ok_or_else(|| "log ingestion sink has no rule id".to_owned())?;

        return Ok(SinkTarget::LogIngestion(LogIngestionTarget::for_table(
            endpoint, rule_id, table,
        )));
    }

    Err("no sink is configured".to_owned())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

/// What happened to the records handed to [`DeliveryRouter::deliver`].
#[derive(Debug)]
pub struct DeliveryReport {
    pub destination: DestinationKind,
    pub sent: u64,
    pub failed: u64,
    /// Records with nothing left to send after schema filtering.
    pub skipped: u64,
    pub errors: Vec<RelayError>,
}

impl DeliveryReport {
    pub fn new(destination: DestinationKind) -> Self {
        Self {
            destination,
            sent: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
        }
    }

    pub fn all_delivered(&self) -> bool {
        self.failed == 0
    }

    /// Adds the counts and errors of `other`, a report for the same destination.
    pub fn absorb(&mut self, other: DeliveryReport) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

/// Sends the records of one table to its sink.
///
/// Log ingestion gets one schema-filtered record per call. The event stream gets the whole batch
/// packed into size-bounded chunks. Every call is retried on retryable faults with exponential
/// backoff, but never past the deadline handed in.
#[derive(Clone)]
pub struct DeliveryRouter<L, E> {
    log_ingestion: L,
    event_stream: E,
    schemas: SchemaRegistry,
    retry: RetryConfig,
    chunk_bytes: usize,
    clock: Arc<dyn Clock>,
}

impl<L, E> DeliveryRouter<L, E>
where
    L: LogIngestionClient + Sync,
    E: EventStreamClient + Sync,
{
    pub fn new(
        log_ingestion: L,
        event_stream: E,
        schemas: SchemaRegistry,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            log_ingestion,
            event_stream,
            schemas,
            retry,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            clock,
        }
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes;
        self
    }

    pub async fn deliver(
        &self,
        table: &str,
        records: Vec<Record>,
        target: &SinkTarget,
        deadline: DateTime<Utc>,
    ) -> DeliveryReport {
        let report = match target {
            SinkTarget::LogIngestion(target) => {
                self.deliver_log_ingestion(table, records, target, deadline)
                    .await
            }
            SinkTarget::EventStream(target) => {
                self.deliver_event_stream(records, target, deadline).await
            }
        };

        let destination = report.destination.to_string();
        counter!(RELAY_RECORDS_SENT_TOTAL, TABLE => table.to_owned(), DESTINATION => destination.clone())
            .increment(report.sent);
        counter!(RELAY_RECORDS_FAILED_TOTAL, TABLE => table.to_owned(), DESTINATION => destination)
            .increment(report.failed);

        report
    }

    async fn deliver_log_ingestion(
        &self,
        table: &str,
        records: Vec<Record>,
        target: &LogIngestionTarget,
        deadline: DateTime<Utc>,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::new(DestinationKind::LogIngestion);

        for record in records {
            let Some(record) = self.schemas.prepare(table, record) else {
                report.skipped += 1;
                continue;
            };
            let batch = [record];

            match self
                .with_retries(deadline, || self.log_ingestion.upload(target, &batch))
                .await
            {
                Ok(()) => report.sent += 1,
                Err(err) => {
                    warn!(table, stream = %target.stream, error = %err, "record upload failed");
                    report.failed += 1;
                    report.errors.push(err);
                }
            }
        }

        if report.skipped > 0 {
            debug!(table, skipped = report.skipped, "records with no sendable fields skipped");
        }

        report
    }

    async fn deliver_event_stream(
        &self,
        records: Vec<Record>,
        target: &EventStreamTarget,
        deadline: DateTime<Utc>,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::new(DestinationKind::EventStream);

        let chunks = match chunk_records(&records, self.chunk_bytes) {
            Ok(chunks) => chunks,
            Err(err) => {
                report.failed = records.len() as u64;
                report.errors.push(err);
                return report;
            }
        };

        for Chunk { payload, records } in chunks {
            match self
                .with_retries(deadline, || {
                    self.event_stream.publish(target, payload.clone())
                })
                .await
            {
                Ok(()) => report.sent += records as u64,
                Err(err) => {
                    warn!(
                        namespace = %target.namespace,
                        name = %target.name,
                        records,
                        error = %err,
                        "event stream chunk failed"
                    );
                    report.failed += records as u64;
                    report.errors.push(err);
                }
            }
        }

        report
    }

    async fn with_retries<F, Fut>(&self, deadline: DateTime<Utc>, mut call: F) -> RelayResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayResult<()>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let remaining = self.clock.remaining_until(deadline);
            if remaining.is_zero() {
                bail!(ErrorKind::Timeout, "Delivery deadline passed");
            }

            let err = match tokio::time::timeout(remaining, call()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => err,
                Err(elapsed) => RelayError::from(elapsed),
            };

            if !err.is_retryable() {
                return Err(err);
            }

            attempt += 1;
            if attempt >= max_attempts {
                return Err(err.reclassify(
                    ErrorKind::RetriesExhausted,
                    "Delivery failed on every attempt",
                ));
            }

            let delay = self.retry.delay_for_attempt(attempt - 1);
            if delay >= self.clock.remaining_until(deadline) {
                return Err(err);
            }

            warn!(attempt, ?delay, error = %err, "delivery failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_utils::sinks::{RecordingEventStream, RecordingLogIngestion};
    use chrono::TimeDelta;
    use relay_config::shared::{EventStreamConfig, LogIngestionConfig};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).unwrap().with_timezone(&Utc)
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn router(
        clock: &ManualClock,
    ) -> (
        RecordingLogIngestion,
        RecordingEventStream,
        DeliveryRouter<RecordingLogIngestion, RecordingEventStream>,
    ) {
        let log_ingestion = RecordingLogIngestion::new();
        let event_stream = RecordingEventStream::new();
        let schemas = SchemaRegistry::new(BTreeMap::from([(
            "Orders".to_owned(),
            vec!["Id".to_owned()],
        )]));
        let router = DeliveryRouter::new(
            log_ingestion.clone(),
            event_stream.clone(),
            schemas,
            RetryConfig::default(),
            Arc::new(clock.clone()),
        );

        (log_ingestion, event_stream, router)
    }

    fn ingestion_sink() -> SinkConfig {
        SinkConfig {
            log_ingestion: Some(LogIngestionConfig {
                endpoint: Some("https://dce.example.com".to_owned()),
                rule_id: Some("dcr-1".to_owned()),
            }),
            event_stream: None,
        }
    }

    #[test]
    fn event_stream_wins_over_log_ingestion() {
        let mut config = ingestion_sink();
        config.event_stream = Some(EventStreamConfig {
            namespace: Some("ns".to_owned()),
            name: Some("orders".to_owned()),
        });

        assert_eq!(
            resolve_sink(&config, "Orders").unwrap(),
            SinkTarget::EventStream(EventStreamTarget::new("ns", "orders"))
        );
        assert_eq!(
            resolve_sink(&ingestion_sink(), "Orders").unwrap(),
            SinkTarget::LogIngestion(LogIngestionTarget::for_table(
                "https://dce.example.com",
                "dcr-1",
                "Orders"
            ))
        );
    }

    #[test]
    fn missing_settings_are_named() {
        let mut config = ingestion_sink();
        config.log_ingestion.as_mut().unwrap().rule_id = None;

        assert_eq!(
            resolve_sink(&config, "Orders").unwrap_err(),
            "log ingestion sink has no rule id"
        );
        assert_eq!(
            resolve_sink(&SinkConfig::default(), "Orders").unwrap_err(),
            "no sink is configured"
        );
    }

    #[tokio::test]
    async fn log_ingestion_sends_one_filtered_record_per_call() {
        let clock = ManualClock::new(at("2024-05-01T08:05:00Z"));
        let (log_ingestion, _, router) = router(&clock);
        let target = resolve_sink(&ingestion_sink(), "Orders").unwrap();

        let report = router
            .deliver(
                "Orders",
                vec![
                    record(json!({"Id": 1, "Note": "a"})),
                    record(json!({"Note": "only"})),
                    record(json!({"Id": 2, "_ItemId": "x"})),
                ],
                &target,
                clock.now() + TimeDelta::minutes(5),
            )
            .await;

        assert_eq!((report.sent, report.failed, report.skipped), (2, 0, 1));
        let uploads = log_ingestion.uploads().await;
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].1, vec![record(json!({"Id": 1}))]);
        assert_eq!(uploads[1].1, vec![record(json!({"Id": 2}))]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_sink_faults_are_retried() {
        let clock = ManualClock::new(at("2024-05-01T08:05:00Z"));
        let (log_ingestion, _, router) = router(&clock);
        let target = resolve_sink(&ingestion_sink(), "Orders").unwrap();
        log_ingestion.fail_next(2, ErrorKind::ServiceUnavailable).await;

        let report = router
            .deliver(
                "Orders",
                vec![record(json!({"Id": 1}))],
                &target,
                clock.now() + TimeDelta::minutes(5),
            )
            .await;

        assert!(report.all_delivered());
        assert_eq!(log_ingestion.attempts().await, 3);
    }

    #[tokio::test]
    async fn terminal_sink_faults_fail_the_record() {
        let clock = ManualClock::new(at("2024-05-01T08:05:00Z"));
        let (log_ingestion, _, router) = router(&clock);
        let target = resolve_sink(&ingestion_sink(), "Orders").unwrap();
        log_ingestion.fail_next(1, ErrorKind::SinkConfigurationError).await;

        let report = router
            .deliver(
                "Orders",
                vec![record(json!({"Id": 1})), record(json!({"Id": 2}))],
                &target,
                clock.now() + TimeDelta::minutes(5),
            )
            .await;

        assert_eq!((report.sent, report.failed), (1, 1));
        assert_eq!(report.errors[0].kind(), ErrorKind::SinkConfigurationError);
        assert_eq!(log_ingestion.attempts().await, 2);
    }

    #[tokio::test]
    async fn retries_never_run_past_the_deadline() {
        let clock = ManualClock::new(at("2024-05-01T08:05:00Z"));
        let (log_ingestion, _, router) = router(&clock);
        let target = resolve_sink(&ingestion_sink(), "Orders").unwrap();
        log_ingestion.fail_next(5, ErrorKind::Timeout).await;

        // The first backoff is a second, more than what is left.
        let report = router
            .deliver(
                "Orders",
                vec![record(json!({"Id": 1}))],
                &target,
                clock.now() + TimeDelta::milliseconds(500),
            )
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(log_ingestion.attempts().await, 1);
    }

    #[tokio::test]
    async fn event_stream_gets_bounded_chunks() {
        let clock = ManualClock::new(at("2024-05-01T08:05:00Z"));
        let (_, event_stream, router) = router(&clock);
        let router = router.with_chunk_bytes(64);
        let target = SinkTarget::EventStream(EventStreamTarget::new("ns", "orders"));
        let records = (0..6)
            .map(|id| record(json!({"Id": id, "Note": "abcdef"})))
            .collect::<Vec<_>>();

        let report = router
            .deliver("Orders", records, &target, clock.now() + TimeDelta::minutes(5))
            .await;

        assert_eq!((report.sent, report.failed), (6, 0));
        let messages = event_stream.messages().await;
        assert!(messages.len() > 1);
        assert!(messages.iter().all(|(_, payload)| payload.len() <= 64));
        // Streaming bypasses the log-ingestion allow-list.
        assert!(messages[0].1.contains("\"Note\""));
    }
}
