//! Domain types shared across the relay engine.

use chrono::{DateTime, Utc};
use relay_config::shared::TableSinkMapping;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::bail;
use crate::error::{ErrorKind, RelayError};

/// One row returned by a filter query, keyed by column name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A table the relay forwards, with the identifier of the sink it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableSpec {
    pub table_name: String,
    pub sink_id: String,
}

impl TableSpec {
    pub fn new(table_name: impl Into<String>, sink_id: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            sink_id: sink_id.into(),
        }
    }
}

impl From<TableSinkMapping> for TableSpec {
    fn from(mapping: TableSinkMapping) -> Self {
        Self {
            table_name: mapping.table_name,
            sink_id: mapping.sink_id,
        }
    }
}

/// Lifecycle of a work queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Available,
    Processing,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Available => "Available",
            QueueStatus::Processing => "Processing",
            QueueStatus::Error => "Error",
        }
    }

    /// Entries that may be claimed. Failed tables stay in rotation.
    pub fn is_claimable(&self) -> bool {
        matches!(self, QueueStatus::Available | QueueStatus::Error)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Available" => Ok(QueueStatus::Available),
            "Processing" => Ok(QueueStatus::Processing),
            "Error" => Ok(QueueStatus::Error),
            other => bail!(
                ErrorKind::DeserializationError,
                "Unknown queue status",
                other
            ),
        }
    }
}

/// A table's slot in the work queue.
#[derive(Debug, Clone, PartialEq)]
pub struct TableQueueEntry {
    pub table_name: String,
    pub sink_id: String,
    pub status: QueueStatus,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub processing_owner: Option<String>,
    pub last_updated_at: DateTime<Utc>,
    /// Version tag of the stored entity, required for conditional writes.
    pub(crate) etag: Option<String>,
}

/// Last successfully processed time of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCheckpoint {
    pub entity_name: String,
    pub last_run_time: DateTime<Utc>,
}

/// Downstream sink a cycle delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    LogIngestion,
    EventStream,
    None,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DestinationKind::LogIngestion => "log_ingestion",
            DestinationKind::EventStream => "event_stream",
            DestinationKind::None => "none",
        };
        f.write_str(name)
    }
}

/// How a table processing cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Queries ran and every record was handed to the sink.
    Completed,
    /// At least one record could not be delivered.
    DeliveryFailed,
    /// The per-call deadline had already passed when the cycle started.
    BlockTimeExceeded,
    /// A setting needed to reach the sink is missing.
    ConfigurationError,
}

/// Result of processing one table for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingCycleResult {
    pub success: bool,
    pub records_sent: u64,
    pub records_failed: u64,
    pub destination: DestinationKind,
    pub timestamp_updated: bool,
    pub outcome: CycleOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProcessingCycleResult {
    pub fn block_time_exceeded() -> Self {
        Self {
            success: true,
            records_sent: 0,
            records_failed: 0,
            destination: DestinationKind::None,
            timestamp_updated: false,
            outcome: CycleOutcome::BlockTimeExceeded,
            message: None,
        }
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            records_sent: 0,
            records_failed: 0,
            destination: DestinationKind::None,
            timestamp_updated: false,
            outcome: CycleOutcome::ConfigurationError,
            message: Some(message.into()),
        }
    }
}
