use serde::{Deserialize, Serialize};

/// Workload identity settings.
///
/// Each outbound call category has its own audience; tokens are requested per call and never
/// shared between categories.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub metadata_endpoint: String,
    pub client_id: Option<String>,
    pub analytics_audience: String,
    pub ingestion_audience: String,
    pub event_stream_audience: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            metadata_endpoint: "http://169.254.169.254/metadata/identity/oauth2/token".to_owned(),
            client_id: None,
            analytics_audience: "https://api.loganalytics.io".to_owned(),
            ingestion_audience: "https://monitor.azure.com".to_owned(),
            event_stream_audience: "https://eventhubs.azure.net".to_owned(),
        }
    }
}
