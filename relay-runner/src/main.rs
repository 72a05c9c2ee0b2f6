use crate::config::load_relay_config;
use crate::core::{RunnerOutcome, start_relay_with_config};
use relay_config::shared::RelayConfig;
use relay_telemetry::metrics::init_metrics;
use relay_telemetry::tracing::init_tracing;
use std::process::ExitCode;
use tracing::{error, info};

mod config;
mod core;

fn main() -> anyhow::Result<ExitCode> {
    let relay_config = load_relay_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"), None)?;

    // We start the runtime.
    let outcome = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(relay_config))?;

    if outcome.is_failure() {
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}

async fn async_main(relay_config: RelayConfig) -> anyhow::Result<RunnerOutcome> {
    // The exporter spawns its listener on the current runtime.
    if let Some(address) = relay_config.metrics_address {
        init_metrics(address, None)?;
        info!(%address, "metrics exporter listening");
    }

    let outcome = match start_relay_with_config(relay_config).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("an error occurred in the relay: {err}");
            return Err(err);
        }
    };

    match &outcome {
        RunnerOutcome::Checked => info!("dry run passed"),
        RunnerOutcome::Blocked { reason } => error!(%reason, "run was not started"),
        RunnerOutcome::Finished(summary) => {
            let summary_json = serde_json::to_string(summary)?;
            info!(
                exit_reason = %summary.exit_reason,
                summary = %summary_json,
                "run finished"
            );
        }
    }

    Ok(outcome)
}
