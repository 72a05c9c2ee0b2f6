use relay::clients::analytics::{AnalyticsStore, LogAnalyticsClient};
use relay::clients::credentials::WorkloadIdentityProvider;
use relay::clients::event_stream::HttpEventStreamClient;
use relay::clients::log_ingestion::HttpLogIngestionClient;
use relay::clock::{Clock, SystemClock};
use relay::delivery::router::DeliveryRouter;
use relay::delivery::schema::SchemaRegistry;
use relay::query::catalog::{QueryCatalog, RemoteCatalog, VersionedCatalog};
use relay::store::checkpoint::CheckpointStore;
use relay::store::queue::WorkQueueStore;
use relay::store::resilient::ResilientClient;
use relay::store::table_service::TableServiceClient;
use relay::supervisor::{RunHandle, StartOutcome, Supervisor};
use relay::workers::activity::TableProcessingActivity;
use relay::workers::processor::RunSummary;
use relay_config::shared::{
    AnalyticsConfig, RelayConfig, RetryConfig, RunConfig, SinkConfig, StoreConfig,
};
use relay_telemetry::tracing::set_global_run_id;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::config::resolve_tables;

/// How an invocation of the runner ended.
#[derive(Debug)]
pub enum RunnerOutcome {
    /// Dry run: configuration and connectivity checked, nothing processed.
    Checked,
    /// The analytics store could not be reached and no run was started.
    Blocked { reason: String },
    Finished(RunSummary),
}

impl RunnerOutcome {
    pub fn is_failure(&self) -> bool {
        match self {
            RunnerOutcome::Checked => false,
            RunnerOutcome::Blocked { .. } => true,
            RunnerOutcome::Finished(summary) => summary.exit_reason.is_failure(),
        }
    }
}

/// Builds the HTTP collaborators from `config` and performs one time-boxed run.
pub async fn start_relay_with_config(config: RelayConfig) -> anyhow::Result<RunnerOutcome> {
    info!("starting relay");

    log_config(&config);

    let tables = resolve_tables(&config);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let tokens = WorkloadIdentityProvider::new(&config.credentials)?;
    let analytics = LogAnalyticsClient::new(
        &config.analytics,
        config.credentials.analytics_audience.clone(),
        tokens.clone(),
    )?;

    if config.dry_run {
        info!(tables = tables.len(), "dry run, checking connectivity only");
        analytics.check_connectivity().await?;
        for table in &tables {
            info!(table = %table.table_name, sink_id = %table.sink_id, "table would be relayed");
        }

        return Ok(RunnerOutcome::Checked);
    }

    let store = ResilientClient::new(TableServiceClient::new(&config.store)?, config.store.retry.clone());
    let queue = WorkQueueStore::new(store.clone(), config.store.queue_table.clone());
    let checkpoints = CheckpointStore::new(store, config.store.checkpoint_table.clone());

    let remote = config
        .catalog
        .remote_catalog_url
        .as_deref()
        .map(RemoteCatalog::new)
        .transpose()?;
    let queries = QueryCatalog::new(VersionedCatalog::from_config(&config.catalog), remote);

    let router = DeliveryRouter::new(
        HttpLogIngestionClient::new(config.credentials.ingestion_audience.clone(), tokens.clone())?,
        HttpEventStreamClient::new(config.credentials.event_stream_audience.clone(), tokens)?,
        SchemaRegistry::new(config.catalog.schemas.clone()),
        delivery_retry(&config.run),
        clock.clone(),
    );

    let run_config = Arc::new(config.run);
    let activity = TableProcessingActivity::new(
        run_config.clone(),
        Arc::new(config.sink),
        analytics.clone(),
        queries,
        router,
        checkpoints,
        clock.clone(),
    );

    let supervisor = Supervisor::new(run_config, tables, queue, activity, analytics, clock);
    match supervisor.start().await? {
        StartOutcome::Blocked { reason } => {
            warn!(%reason, "run blocked");
            Ok(RunnerOutcome::Blocked { reason })
        }
        StartOutcome::Started(handle) => {
            let summary = wait_for_run(handle).await?;
            Ok(RunnerOutcome::Finished(summary))
        }
    }
}

/// Delivery calls are retried `max_retries` times in total, with the store's backoff shape.
fn delivery_retry(run: &RunConfig) -> RetryConfig {
    RetryConfig {
        max_attempts: run.max_retries.max(1),
        ..RetryConfig::default()
    }
}

fn log_config(config: &RelayConfig) {
    log_run_config(&config.run);
    log_store_config(&config.store);
    log_analytics_config(&config.analytics);
    log_sink_config(&config.sink);
    debug!(
        versioned_tables = config.catalog.queries.len(),
        remote_catalog = config.catalog.remote_catalog_url.is_some(),
        schemas = config.catalog.schemas.len(),
        "catalog config"
    );
}

fn log_run_config(config: &RunConfig) {
    debug!(
        batch_size = config.batch_size,
        query_interval_minutes = config.query_interval_minutes,
        max_retries = config.max_retries,
        health_check_interval = config.health_check_interval,
        restart_on_error = config.restart_on_error,
        max_cycles = config.max_cycles,
        max_execution_minutes = config.max_execution_minutes,
        safety_buffer_secs = config.safety_buffer_secs,
        "run config"
    );
}

fn log_store_config(config: &StoreConfig) {
    debug!(
        account_name = config.account_name,
        endpoint = config.endpoint(),
        queue_table = config.queue_table,
        checkpoint_table = config.checkpoint_table,
        max_attempts = config.retry.max_attempts,
        "store config"
    );
}

fn log_analytics_config(config: &AnalyticsConfig) {
    debug!(
        workspace_id = config.workspace_id,
        base_url = config.base_url,
        query_timeout_secs = config.query_timeout_secs,
        "analytics config"
    );
}

fn log_sink_config(config: &SinkConfig) {
    match (&config.event_stream, &config.log_ingestion) {
        (Some(stream), _) => debug!(
            namespace = stream.namespace.as_deref().unwrap_or_default(),
            name = stream.name.as_deref().unwrap_or_default(),
            "using event stream sink"
        ),
        (None, Some(ingestion)) => debug!(
            endpoint = ingestion.endpoint.as_deref().unwrap_or_default(),
            rule_id = ingestion.rule_id.as_deref().unwrap_or_default(),
            "using log ingestion sink"
        ),
        (None, None) => warn!("no sink is configured, every table cycle will fail"),
    }
}

/// Waits for the run, turning SIGINT and SIGTERM into a shutdown request.
///
/// A shutdown lets the current table finish and release its queue entry before the run ends.
#[tracing::instrument(skip(handle), fields(run_id = handle.run_id()))]
async fn wait_for_run(handle: RunHandle) -> anyhow::Result<RunSummary> {
    set_global_run_id(handle.run_id().to_owned());

    let shutdown_tx = handle.shutdown_tx();
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT (Ctrl+C) received, shutting down run");
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down run");
            }
        }

        if let Err(err) = shutdown_tx.shutdown() {
            warn!("failed to send shutdown signal: {:?}", err);
        }
    });

    let result = handle.wait().await;

    // The signal listener outlives a run that finished on its own.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    Ok(result?)
}

