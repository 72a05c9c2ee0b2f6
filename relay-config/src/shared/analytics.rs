use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Analytical store the filter queries run against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub workspace_id: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Server-side timeout of one query.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl AnalyticsConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workspace_id.trim().is_empty() {
            return Err(ValidationError::MissingWorkspaceId);
        }

        Ok(())
    }
}

fn default_base_url() -> String {
    "https://api.loganalytics.io".to_owned()
}

fn default_query_timeout_secs() -> u64 {
    120
}
