use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use metrics::{counter, histogram};
use relay_config::shared::RunConfig;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::clients::analytics::AnalyticsStore;
use crate::clock::Clock;
use crate::concurrency::shutdown::{ShutdownRx, shutdown_requested};
use crate::context::{RunContext, TableFailure};
use crate::error::{ErrorKind, RelayError, RelayResult};
use crate::metrics::{
    EXIT_REASON, OUTCOME, RELAY_ACTIVITY_DURATION_SECONDS, RELAY_CYCLES_TOTAL, RELAY_RUNS_TOTAL,
    TABLE,
};
use crate::relay_error;
use crate::store::base::KeyValueStore;
use crate::store::queue::{Release, WorkQueueStore};
use crate::types::{CycleOutcome, ProcessingCycleResult, TableQueueEntry};
use crate::workers::activity::TableProcessor;

/// Longest time a single table may take.
const MAX_CALL_DURATION: Duration = Duration::from_secs(8 * 60);
/// Kept free between a call's deadline and the run deadline for releasing the entry.
const DISPATCH_MARGIN: Duration = Duration::from_secs(15);
/// Extra time a call gets past its own deadline before it is abandoned.
const DISPATCH_GRACE: Duration = Duration::from_secs(5);
const QUEUE_CALL_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TimeBoundaryReached,
    CycleLimitReached,
    NoTablesAvailable,
    QueueManagerError,
    ConnectivityLost,
    TableErrorStop,
    Shutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TimeBoundaryReached => "time_boundary_reached",
            ExitReason::CycleLimitReached => "cycle_limit_reached",
            ExitReason::NoTablesAvailable => "no_tables_available",
            ExitReason::QueueManagerError => "queue_manager_error",
            ExitReason::ConnectivityLost => "connectivity_lost",
            ExitReason::TableErrorStop => "table_error_stop",
            ExitReason::Shutdown => "shutdown",
        }
    }

    /// Whether the run ended because something broke rather than because it ran out of work,
    /// time or cycles.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExitReason::QueueManagerError | ExitReason::ConnectivityLost | ExitReason::TableErrorStop
        )
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loop state of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub deadline: DateTime<Utc>,
    pub cycle_count: u64,
    pub records_processed: u64,
    pub consecutive_empty_cycles: u32,
    pub exit_reason: Option<ExitReason>,
}

impl RunState {
    pub fn new(deadline: DateTime<Utc>) -> Self {
        Self {
            deadline,
            cycle_count: 0,
            records_processed: 0,
            consecutive_empty_cycles: 0,
            exit_reason: None,
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub cycles: u64,
    pub successes: u64,
    pub failures: u64,
    pub records_sent: u64,
    pub records_failed: u64,
    pub exit_reason: ExitReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_tables: Vec<TableFailure>,
}

#[derive(Debug, Default)]
struct Tally {
    successes: u64,
    failures: u64,
    records_sent: u64,
    records_failed: u64,
}

/// The run loop: claims the table processed longest ago, processes it, hands it back, repeats.
///
/// Tables are processed strictly one at a time. A failing table is recorded and the loop moves
/// on; only the work queue itself failing, a lost connection to the analytical store or the
/// run's own limits end the run.
pub struct ContinuousQueueProcessor<S, P, A> {
    config: Arc<RunConfig>,
    queue: WorkQueueStore<S>,
    processor: P,
    analytics: A,
    clock: Arc<dyn Clock>,
    shutdown_rx: ShutdownRx,
}

impl<S, P, A> ContinuousQueueProcessor<S, P, A>
where
    S: KeyValueStore + Sync,
    P: TableProcessor + Sync,
    A: AnalyticsStore + Sync,
{
    pub fn new(
        config: Arc<RunConfig>,
        queue: WorkQueueStore<S>,
        processor: P,
        analytics: A,
        clock: Arc<dyn Clock>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            config,
            queue,
            processor,
            analytics,
            clock,
            shutdown_rx,
        }
    }

    pub async fn run(self, ctx: Arc<RunContext>) -> RunSummary {
        let started_at = self.clock.now();
        let mut state = RunState::new(ctx.deadline());
        let mut tally = Tally::default();
        let mut run_error = None;

        info!(deadline = %state.deadline, "run loop started");

        let exit_reason = loop {
            if shutdown_requested(&self.shutdown_rx) {
                break ExitReason::Shutdown;
            }

            let now = self.clock.now();
            if now >= state.deadline {
                break ExitReason::TimeBoundaryReached;
            }
            if state.cycle_count >= self.config.max_cycles {
                break ExitReason::CycleLimitReached;
            }

            // Checked before claiming so no entry is left `Processing` for want of time.
            let Some(call_deadline) = self.call_deadline(now, state.deadline) else {
                info!("remaining time is too short for another table");
                break ExitReason::TimeBoundaryReached;
            };

            let claimed = match self
                .queue_call(self.queue.claim_next(ctx.run_id(), now))
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(error = %err, "claiming from the work queue failed");
                    run_error = Some(err.to_string());
                    break ExitReason::QueueManagerError;
                }
            };

            let Some(entry) = claimed else {
                state.consecutive_empty_cycles += 1;
                if state.consecutive_empty_cycles >= self.config.max_consecutive_empty_cycles {
                    break ExitReason::NoTablesAvailable;
                }

                let poll = self.config.queue_poll_interval();
                if !poll.is_zero() {
                    tokio::time::sleep(poll.min(self.clock.remaining_until(state.deadline))).await;
                }
                continue;
            };
            state.consecutive_empty_cycles = 0;

            let cycle = state.cycle_count + 1;
            let table_name = entry.table_name.clone();
            let outcome = self.dispatch(&ctx, &entry, call_deadline).await;

            let release = match &outcome {
                Ok(result) if result.outcome == CycleOutcome::BlockTimeExceeded => {
                    Release::Deferred
                }
                Ok(result) if result.success => Release::Succeeded,
                _ => Release::Failed,
            };

            self.record_outcome(&ctx, &table_name, cycle, &outcome, &mut state, &mut tally)
                .await;

            if let Err(err) = self
                .queue_call(self.queue.release(entry, release, self.clock.now()))
                .await
            {
                error!(table = %table_name, error = %err, "releasing the queue entry failed");
                run_error = Some(err.to_string());
                break ExitReason::QueueManagerError;
            }

            state.cycle_count = cycle;

            if release == Release::Failed && !self.config.restart_on_error {
                break ExitReason::TableErrorStop;
            }

            if self.config.health_check_interval > 0
                && state.cycle_count % self.config.health_check_interval == 0
                && let Err(err) = self.health_check().await
            {
                error!(error = %err, "connectivity check failed");
                run_error = Some(err.to_string());
                break ExitReason::ConnectivityLost;
            }
        };
        state.exit_reason = Some(exit_reason);

        let summary = RunSummary {
            run_id: ctx.run_id().to_owned(),
            started_at,
            finished_at: self.clock.now(),
            deadline: state.deadline,
            cycles: state.cycle_count,
            successes: tally.successes,
            failures: tally.failures,
            records_sent: tally.records_sent,
            records_failed: tally.records_failed,
            exit_reason,
            error: run_error,
            failed_tables: ctx.failures().await,
        };

        counter!(RELAY_RUNS_TOTAL, EXIT_REASON => exit_reason.as_str()).increment(1);
        info!(
            exit_reason = %exit_reason,
            cycles = summary.cycles,
            successes = summary.successes,
            failures = summary.failures,
            records_sent = summary.records_sent,
            records_failed = summary.records_failed,
            "run loop finished"
        );

        summary
    }

    /// Deadline of the next call: at most [`MAX_CALL_DURATION`] away and strictly inside the
    /// run's remaining time. `None` when no usable time is left.
    fn call_deadline(&self, now: DateTime<Utc>, run_deadline: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let margin = TimeDelta::from_std(DISPATCH_MARGIN + DISPATCH_GRACE).ok()?;
        let longest = TimeDelta::from_std(MAX_CALL_DURATION).ok()?;
        let call_deadline = (now + longest).min(run_deadline - margin);

        (call_deadline > now).then_some(call_deadline)
    }

    async fn dispatch(
        &self,
        ctx: &RunContext,
        entry: &TableQueueEntry,
        call_deadline: DateTime<Utc>,
    ) -> RelayResult<ProcessingCycleResult> {
        let budget = self.clock.remaining_until(call_deadline) + DISPATCH_GRACE;
        let started = Instant::now();

        let call = AssertUnwindSafe(self.processor.process(ctx, entry, call_deadline)).catch_unwind();
        let result = match tokio::time::timeout(budget, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(relay_error!(
                ErrorKind::InvalidState,
                "Table processing panicked",
                panic_message(panic.as_ref())
            )),
            Err(elapsed) => Err(RelayError::from(elapsed)),
        };

        histogram!(RELAY_ACTIVITY_DURATION_SECONDS, TABLE => entry.table_name.clone())
            .record(started.elapsed().as_secs_f64());

        result
    }

    async fn record_outcome(
        &self,
        ctx: &RunContext,
        table_name: &str,
        cycle: u64,
        outcome: &RelayResult<ProcessingCycleResult>,
        state: &mut RunState,
        tally: &mut Tally,
    ) {
        let now = self.clock.now();

        let label = match outcome {
            Ok(result) => {
                tally.records_sent += result.records_sent;
                tally.records_failed += result.records_failed;
                state.records_processed += result.records_sent;

                if result.success {
                    tally.successes += 1;
                    "success"
                } else {
                    tally.failures += 1;
                    warn!(
                        table = table_name,
                        cycle,
                        outcome = ?result.outcome,
                        message = result.message.as_deref().unwrap_or_default(),
                        "table cycle failed"
                    );
                    ctx.record_failure(TableFailure {
                        table_name: table_name.to_owned(),
                        cycle,
                        kind: format!("{:?}", result.outcome),
                        message: result.message.clone().unwrap_or_default(),
                        at: now,
                    })
                    .await;
                    "failure"
                }
            }
            Err(err) => {
                tally.failures += 1;
                error!(table = table_name, cycle, error = %err, "table cycle errored");
                ctx.record_error(table_name, cycle, err, now).await;
                "error"
            }
        };

        counter!(RELAY_CYCLES_TOTAL, OUTCOME => label).increment(1);
    }

    async fn queue_call<T>(&self, call: impl Future<Output = RelayResult<T>>) -> RelayResult<T> {
        match tokio::time::timeout(QUEUE_CALL_TIMEOUT, call).await {
            Ok(result) => result.map_err(|err| {
                err.reclassify(ErrorKind::QueueManagerError, "Work queue call failed")
            }),
            Err(elapsed) => Err(RelayError::from(elapsed)
                .reclassify(ErrorKind::QueueManagerError, "Work queue call timed out")),
        }
    }

    async fn health_check(&self) -> RelayResult<()> {
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.analytics.check_connectivity()).await {
            Ok(result) => result.map_err(|err| {
                err.reclassify(ErrorKind::ConnectivityError, "Analytics store unreachable")
            }),
            Err(elapsed) => Err(RelayError::from(elapsed)
                .reclassify(ErrorKind::ConnectivityError, "Connectivity check timed out")),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
