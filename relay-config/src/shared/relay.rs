use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::Config;
use crate::shared::{
    AnalyticsConfig, CatalogConfig, CredentialConfig, RunConfig, SinkConfig, StoreConfig,
    TABLE_SINK_PREFIX, TableSinkMapping, ValidationError, discover_tables,
};

/// Complete configuration of a relay deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig {
    #[serde(default)]
    pub run: RunConfig,
    pub store: StoreConfig,
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Free-form application settings. Entries prefixed with `TABLE_SINK_` declare tables.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Where the Prometheus exporter listens. No exporter is started when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_address: Option<SocketAddr>,
    /// Only validate the configuration and probe the analytics store, without starting a run.
    #[serde(default)]
    pub dry_run: bool,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.run.validate()?;
        self.store.validate()?;
        self.analytics.validate()?;

        Ok(())
    }

    /// Tables declared in the settings section.
    pub fn declared_tables(&self) -> Vec<TableSinkMapping> {
        discover_tables(&self.settings, TABLE_SINK_PREFIX)
    }
}

impl Config for RelayConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
