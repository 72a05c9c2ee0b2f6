use serde::{Deserialize, Serialize};

/// Downstream sink settings.
///
/// Both variants may be present in a deployment's files, but only one is ever used: when an
/// event stream is configured it replaces the log-ingestion endpoint. Missing fields are not
/// rejected here; the table processing reports them as a configuration failure for the cycle.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_ingestion: Option<LogIngestionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_stream: Option<EventStreamConfig>,
}

/// Structured log-ingestion endpoint with its routing rule.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogIngestionConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub rule_id: Option<String>,
}

/// Streaming event sink addressed by namespace and name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventStreamConfig {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}
