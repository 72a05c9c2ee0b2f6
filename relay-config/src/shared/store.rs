use serde::{Deserialize, Serialize};

use crate::SerializableSecretString;
use crate::shared::{RetryConfig, ValidationError};

/// Settings of the key-value table service holding the work queue and the checkpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage account name, used both in the default endpoint and in request signing.
    pub account_name: String,
    /// Base64 encoded shared key of the account.
    pub account_key: SerializableSecretString,
    /// Overrides `https://{account_name}.table.core.windows.net`, e.g. for a local emulator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_queue_table")]
    pub queue_table: String,
    #[serde(default = "default_checkpoint_table")]
    pub checkpoint_table: String,
    /// Timeout of a single store request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.account_name.trim().is_empty() {
            return Err(ValidationError::MissingStoreAccount);
        }

        if self.account_key.is_blank() {
            return Err(ValidationError::MissingStoreKey);
        }

        if self.retry.max_attempts == 0 {
            return Err(ValidationError::RetryAttemptsZero);
        }

        Ok(())
    }

    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_owned(),
            None => format!("https://{}.table.core.windows.net", self.account_name),
        }
    }
}

fn default_queue_table() -> String {
    "relayqueue".to_owned()
}

fn default_checkpoint_table() -> String {
    "relaycheckpoints".to_owned()
}

fn default_request_timeout_secs() -> u64 {
    30
}
