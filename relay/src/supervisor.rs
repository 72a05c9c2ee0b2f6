use chrono::{DateTime, TimeDelta, Utc};
use metrics::{counter, gauge};
use relay_config::shared::{RunConfig, TABLE_SINK_PREFIX};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, warn};
use uuid::Uuid;

use crate::bail;
use crate::clients::analytics::AnalyticsStore;
use crate::clock::Clock;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::context::RunContext;
use crate::error::{ErrorKind, RelayError, RelayResult};
use crate::metrics::{EXIT_REASON, RELAY_RUNS_TOTAL, RELAY_TABLES_TOTAL, register_metrics};
use crate::relay_error;
use crate::store::base::KeyValueStore;
use crate::store::queue::WorkQueueStore;
use crate::types::TableSpec;
use crate::workers::activity::TableProcessor;
use crate::workers::processor::{ContinuousQueueProcessor, RunSummary};

const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of asking the supervisor to start a run.
#[derive(Debug)]
pub enum StartOutcome {
    /// The analytical store could not be reached; no run was started.
    Blocked { reason: String },
    Started(RunHandle),
}

/// A run executing in the background.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    deadline: DateTime<Utc>,
    shutdown_tx: ShutdownTx,
    handle: Option<JoinHandle<RunSummary>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Asks the run to stop before its next cycle.
    pub fn shutdown(&self) {
        if self.shutdown_tx.shutdown().is_err() {
            info!(run_id = %self.run_id, "run already finished, shutdown not delivered");
        }
    }

    /// Waits for the run to finish.
    pub async fn wait(mut self) -> RelayResult<RunSummary> {
        let Some(handle) = self.handle.take() else {
            bail!(ErrorKind::InvalidState, "Run was already awaited");
        };

        handle
            .await
            .map_err(|err| relay_error!(ErrorKind::InvalidState, "Run task did not complete", err))
    }
}

/// Starts one time-boxed run.
///
/// A run is never retried here: when the analytical store is unreachable the start is blocked
/// and the external scheduler decides when to try again.
pub struct Supervisor<S, P, A> {
    config: Arc<RunConfig>,
    tables: Vec<TableSpec>,
    queue: WorkQueueStore<S>,
    processor: P,
    analytics: A,
    clock: Arc<dyn Clock>,
}

impl<S, P, A> Supervisor<S, P, A>
where
    S: KeyValueStore + Send + Sync + 'static,
    P: TableProcessor + Send + Sync + 'static,
    A: AnalyticsStore + Send + Sync + 'static,
{
    pub fn new(
        config: Arc<RunConfig>,
        tables: Vec<TableSpec>,
        queue: WorkQueueStore<S>,
        processor: P,
        analytics: A,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            tables,
            queue,
            processor,
            analytics,
            clock,
        }
    }

    /// Validates, seeds the work queue and starts the run loop without waiting for it.
    #[tracing::instrument(skip_all, fields(tables = self.tables.len()))]
    pub async fn start(self) -> RelayResult<StartOutcome> {
        register_metrics();

        self.config.validate()?;
        if self.tables.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "No tables are configured",
                format!("declare at least one {TABLE_SINK_PREFIX}<table> entry")
            );
        }

        if let Err(err) = self.check_connectivity().await {
            warn!(error = %err, "analytics store unreachable, run not started");
            counter!(RELAY_RUNS_TOTAL, EXIT_REASON => "blocked").increment(1);
            return Ok(StartOutcome::Blocked {
                reason: err.to_string(),
            });
        }

        let now = self.clock.now();
        let deadline = run_deadline(&self.config, now)?;

        self.queue
            .initialize()
            .await
            .map_err(|err| err.reclassify(ErrorKind::QueueManagerError, "Work queue unavailable"))?;
        let seeded = self
            .queue
            .seed(&self.tables, now)
            .await
            .map_err(|err| err.reclassify(ErrorKind::QueueManagerError, "Work queue seeding failed"))?;
        gauge!(RELAY_TABLES_TOTAL).set(seeded as f64);

        self.processor.prepare().await?;

        let run_id = Uuid::new_v4().to_string();
        let ctx = Arc::new(RunContext::new(run_id.clone(), deadline));
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let processor = ContinuousQueueProcessor::new(
            self.config,
            self.queue,
            self.processor,
            self.analytics,
            self.clock,
            shutdown_rx,
        );

        let run_span = tracing::info_span!("relay_run", run_id = %run_id);
        let handle = tokio::spawn(processor.run(ctx).instrument(run_span));

        info!(%run_id, %deadline, tables = seeded, "run started");

        Ok(StartOutcome::Started(RunHandle {
            run_id,
            deadline,
            shutdown_tx,
            handle: Some(handle),
        }))
    }

    async fn check_connectivity(&self) -> RelayResult<()> {
        match tokio::time::timeout(CONNECTIVITY_TIMEOUT, self.analytics.check_connectivity()).await {
            Ok(result) => result.map_err(|err| {
                err.reclassify(ErrorKind::ConnectivityError, "Analytics store unreachable")
            }),
            Err(elapsed) => Err(RelayError::from(elapsed)
                .reclassify(ErrorKind::ConnectivityError, "Connectivity check timed out")),
        }
    }
}

/// `now + max_execution - safety_buffer`.
pub fn run_deadline(config: &RunConfig, now: DateTime<Utc>) -> RelayResult<DateTime<Utc>> {
    let window = config
        .max_execution()
        .checked_sub(config.safety_buffer())
        .ok_or_else(|| relay_error!(ErrorKind::ConfigError, "Safety buffer exceeds the run window"))?;
    let window = TimeDelta::from_std(window)
        .map_err(|err| relay_error!(ErrorKind::ConfigError, "Run window is out of range", err))?;

    Ok(now + window)
}
