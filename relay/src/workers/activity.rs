use chrono::{DateTime, TimeDelta, Utc};
use relay_config::shared::{RunConfig, SinkConfig};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clients::analytics::AnalyticsStore;
use crate::clients::event_stream::EventStreamClient;
use crate::clients::log_ingestion::LogIngestionClient;
use crate::clock::Clock;
use crate::context::RunContext;
use crate::delivery::router::{DeliveryReport, DeliveryRouter, SinkTarget, resolve_sink};
use crate::error::{ErrorKind, RelayResult};
use crate::query::catalog::QuerySource;
use crate::query::windower::{TimeWindow, apply_window};
use crate::relay_error;
use crate::store::base::KeyValueStore;
use crate::store::checkpoint::CheckpointStore;
use crate::types::{CycleOutcome, ProcessingCycleResult, Record, TableQueueEntry};

/// Processes one claimed table for one cycle.
pub trait TableProcessor {
    /// Creates whatever the processor persists into, once per run before the first cycle.
    fn prepare(&self) -> impl Future<Output = RelayResult<()>> + Send;

    /// Processes `entry`, finishing before `deadline`.
    ///
    /// Problems confined to the table, such as a missing sink setting or rejected records, are
    /// reported through the result. An error means the cycle itself broke down.
    fn process(
        &self,
        ctx: &RunContext,
        entry: &TableQueueEntry,
        deadline: DateTime<Utc>,
    ) -> impl Future<Output = RelayResult<ProcessingCycleResult>> + Send;
}

/// Queries the analytical store for a table's new rows and forwards them to the table's sink.
///
/// Every cycle scans `[checkpoint, now)`, never more than one query interval back, and moves
/// the checkpoint to `now` only when every record reached the sink. A cycle that failed a
/// delivery therefore scans the same rows again next time.
pub struct TableProcessingActivity<A, Q, L, E, S> {
    config: Arc<RunConfig>,
    sink: Arc<SinkConfig>,
    analytics: A,
    queries: Q,
    router: DeliveryRouter<L, E>,
    checkpoints: CheckpointStore<S>,
    clock: Arc<dyn Clock>,
}

impl<A, Q, L, E, S> TableProcessingActivity<A, Q, L, E, S>
where
    A: AnalyticsStore + Sync,
    Q: QuerySource + Sync,
    L: LogIngestionClient + Sync,
    E: EventStreamClient + Sync,
    S: KeyValueStore + Sync,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RunConfig>,
        sink: Arc<SinkConfig>,
        analytics: A,
        queries: Q,
        router: DeliveryRouter<L, E>,
        checkpoints: CheckpointStore<S>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            sink,
            analytics,
            queries,
            router,
            checkpoints,
            clock,
        }
    }

    #[tracing::instrument(skip_all, fields(table = %entry.table_name, run_id = %ctx.run_id()))]
    async fn run_cycle(
        &self,
        ctx: &RunContext,
        entry: &TableQueueEntry,
        deadline: DateTime<Utc>,
    ) -> RelayResult<ProcessingCycleResult> {
        let table = entry.table_name.as_str();
        let now = self.clock.now();

        if now >= deadline {
            info!(%deadline, "call deadline already passed, table not processed");
            return Ok(ProcessingCycleResult::block_time_exceeded());
        }

        let target = match resolve_sink(&self.sink, table) {
            Ok(target) => target,
            Err(message) => {
                warn!(%message, "sink is not configured");
                return Ok(ProcessingCycleResult::configuration_error(message));
            }
        };

        let max_window = TimeDelta::from_std(self.config.query_interval()).map_err(|err| {
            relay_error!(ErrorKind::ConfigError, "Query interval is out of range", err)
        })?;
        let checkpoint = self.checkpoints.load(table, now, max_window).await?;
        let window = TimeWindow::new(checkpoint.last_run_time.max(now - max_window), now);

        if window.is_empty() {
            debug!(from = %window.from, to = %window.to, "window is empty, nothing to scan");
            return Ok(ProcessingCycleResult {
                success: true,
                records_sent: 0,
                records_failed: 0,
                destination: target.kind(),
                timestamp_updated: false,
                outcome: CycleOutcome::Completed,
                message: None,
            });
        }

        let records = self.collect_records(table, &window, deadline).await?;
        let matched = records.len();
        let report = self
            .deliver_in_batches(table, records, &target, deadline)
            .await;

        let mut result = ProcessingCycleResult {
            success: report.all_delivered(),
            records_sent: report.sent,
            records_failed: report.failed,
            destination: report.destination,
            timestamp_updated: false,
            outcome: if report.all_delivered() {
                CycleOutcome::Completed
            } else {
                CycleOutcome::DeliveryFailed
            },
            message: report.errors.first().map(ToString::to_string),
        };

        if report.all_delivered() {
            match self.checkpoints.commit(table, now).await {
                Ok(()) => result.timestamp_updated = true,
                Err(err) => {
                    error!(error = %err, "records delivered but checkpoint not advanced");
                    result.success = false;
                    result.message = Some(format!("checkpoint not advanced: {err}"));
                }
            }
        } else {
            warn!(
                failed = report.failed,
                "deliveries failed, checkpoint left at {}", checkpoint.last_run_time
            );
        }

        info!(
            from = %window.from,
            to = %window.to,
            matched,
            sent = result.records_sent,
            failed = result.records_failed,
            destination = %result.destination,
            "table processed"
        );

        Ok(result)
    }

    /// Runs every query of `table` over `window`. A query that cannot run is skipped.
    async fn collect_records(
        &self,
        table: &str,
        window: &TimeWindow,
        deadline: DateTime<Utc>,
    ) -> RelayResult<Vec<Record>> {
        let definitions = self.queries.queries(table).await?;
        if definitions.is_empty() {
            warn!(table, "no queries are defined for table");
        }

        let mut records = Vec::new();
        for definition in definitions {
            let windowed = match apply_window(&definition.query, window) {
                Ok(windowed) => windowed,
                Err(err) => {
                    warn!(query = %definition.name, error = %err, "query skipped");
                    continue;
                }
            };
            for warning in &windowed.warnings {
                warn!(query = %definition.name, warning = %warning, "query rewritten");
            }

            let remaining = self.clock.remaining_until(deadline);
            let rows = match tokio::time::timeout(
                remaining,
                self.analytics.execute_query(&windowed.query),
            )
            .await
            {
                Ok(Ok(rows)) => rows,
                Ok(Err(err)) => {
                    warn!(query = %definition.name, error = %err, "query failed, skipped");
                    continue;
                }
                Err(_) => {
                    warn!(query = %definition.name, "query ran into the call deadline, skipped");
                    continue;
                }
            };

            debug!(query = %definition.name, rows = rows.len(), "query matched");
            records.extend(rows);
        }

        Ok(records)
    }

    /// Sends `records` to the sink in groups of at most `batch_size`. Every record is attempted,
    /// so the report accounts for the whole window.
    async fn deliver_in_batches(
        &self,
        table: &str,
        records: Vec<Record>,
        target: &SinkTarget,
        deadline: DateTime<Utc>,
    ) -> DeliveryReport {
        let batch_size = self.config.batch_size.max(1);
        let mut report = DeliveryReport::new(target.kind());
        let mut records = records.into_iter().peekable();

        while records.peek().is_some() {
            let batch = records.by_ref().take(batch_size).collect::<Vec<_>>();
            debug!(records = batch.len(), "delivering batch");
            report.absorb(self.router.deliver(table, batch, target, deadline).await);
        }

        report
    }
}

impl<A, Q, L, E, S> TableProcessor for TableProcessingActivity<A, Q, L, E, S>
where
    A: AnalyticsStore + Sync,
    Q: QuerySource + Sync,
    L: LogIngestionClient + Sync,
    E: EventStreamClient + Sync,
    S: KeyValueStore + Sync,
{
    async fn prepare(&self) -> RelayResult<()> {
        self.checkpoints.initialize().await
    }

    async fn process(
        &self,
        ctx: &RunContext,
        entry: &TableQueueEntry,
        deadline: DateTime<Utc>,
    ) -> RelayResult<ProcessingCycleResult> {
        self.run_cycle(ctx, entry, deadline).await
    }
}
