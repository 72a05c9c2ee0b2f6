use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

static REGISTER_METRICS: Once = Once::new();

pub const RELAY_TABLES_TOTAL: &str = "relay_tables_total";
pub const RELAY_CYCLES_TOTAL: &str = "relay_cycles_total";
pub const RELAY_RECORDS_SENT_TOTAL: &str = "relay_records_sent_total";
pub const RELAY_RECORDS_FAILED_TOTAL: &str = "relay_records_failed_total";
pub const RELAY_CLAIM_CONFLICTS_TOTAL: &str = "relay_claim_conflicts_total";
pub const RELAY_STORE_RETRIES_TOTAL: &str = "relay_store_retries_total";
pub const RELAY_ACTIVITY_DURATION_SECONDS: &str = "relay_activity_duration_seconds";
pub const RELAY_RUNS_TOTAL: &str = "relay_runs_total";

pub const TABLE: &str = "table";
pub const DESTINATION: &str = "destination";
pub const OUTCOME: &str = "outcome";
pub const EXIT_REASON: &str = "exit_reason";
pub const OPERATION: &str = "operation";

/// Describes the relay metrics to the installed recorder.
///
/// Safe to call more than once; the descriptions are registered a single time.
pub(crate) fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_gauge!(
            RELAY_TABLES_TOTAL,
            Unit::Count,
            "Number of tables seeded into the work queue for the current run"
        );

        describe_counter!(
            RELAY_CYCLES_TOTAL,
            Unit::Count,
            "Processing cycles that dispatched a table, labelled by outcome"
        );

        describe_counter!(
            RELAY_RECORDS_SENT_TOTAL,
            Unit::Count,
            "Records accepted by a downstream sink"
        );

        describe_counter!(
            RELAY_RECORDS_FAILED_TOTAL,
            Unit::Count,
            "Records a downstream sink did not accept after retries"
        );

        describe_counter!(
            RELAY_CLAIM_CONFLICTS_TOTAL,
            Unit::Count,
            "Queue claims lost to a concurrent writer"
        );

        describe_counter!(
            RELAY_STORE_RETRIES_TOTAL,
            Unit::Count,
            "Key-value store calls repeated after a retryable failure"
        );

        describe_histogram!(
            RELAY_ACTIVITY_DURATION_SECONDS,
            Unit::Seconds,
            "Time spent processing one table in one cycle"
        );

        describe_counter!(
            RELAY_RUNS_TOTAL,
            Unit::Count,
            "Finished runs, labelled by exit reason"
        );
    });
}
