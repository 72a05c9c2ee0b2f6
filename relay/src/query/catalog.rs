use relay_config::shared::{CatalogConfig, QueryDefinitionConfig};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::bail;
use crate::classifier::{CallCategory, classify_status};
use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;

const CATALOG_TIMEOUT: Duration = Duration::from_secs(30);

/// A named filter query of one table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query: String,
}

impl From<QueryDefinitionConfig> for QueryDefinition {
    fn from(value: QueryDefinitionConfig) -> Self {
        Self {
            name: value.name,
            description: value.description,
            query: value.query,
        }
    }
}

/// Supplies the filter queries of a table.
pub trait QuerySource {
    fn queries(
        &self,
        table: &str,
    ) -> impl Future<Output = RelayResult<Vec<QueryDefinition>>> + Send;
}

/// Queries shipped with the deployment's configuration.
#[derive(Debug, Clone, Default)]
pub struct VersionedCatalog {
    queries: BTreeMap<String, Vec<QueryDefinition>>,
}

impl VersionedCatalog {
    pub fn new(queries: BTreeMap<String, Vec<QueryDefinition>>) -> Self {
        Self { queries }
    }

    pub fn from_config(config: &CatalogConfig) -> Self {
        let queries = config
            .queries
            .iter()
            .map(|(table, definitions)| {
                let definitions = definitions.iter().cloned().map(Into::into).collect();
                (table.clone(), definitions)
            })
            .collect();

        Self { queries }
    }

    pub fn with_query(mut self, table: &str, definition: QueryDefinition) -> Self {
        self.queries.entry(table.to_owned()).or_default().push(definition);
        self
    }
}

impl QuerySource for VersionedCatalog {
    async fn queries(&self, table: &str) -> RelayResult<Vec<QueryDefinition>> {
        Ok(self.queries.get(table).cloned().unwrap_or_default())
    }
}

/// Managed query source served over HTTP as `GET {url}?table={table}`.
#[derive(Debug, Clone)]
pub struct RemoteCatalog {
    client: Client,
    url: String,
}

impl RemoteCatalog {
    pub fn new(url: impl Into<String>) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(CATALOG_TIMEOUT)
            .build()
            .map_err(|err| relay_error!(ErrorKind::ConfigError, "Failed to build HTTP client", err))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl QuerySource for RemoteCatalog {
    async fn queries(&self, table: &str) -> RelayResult<Vec<QueryDefinition>> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("table", table)])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status, &body, CallCategory::Catalog);
            bail!(kind, "Remote query catalog request failed", format!("{status}: {body}"));
        }

        Ok(response.json().await?)
    }
}

/// The versioned catalog merged with an optional managed source.
///
/// The managed source only adds queries: a remote query whose name is already in the versioned
/// catalog is ignored. A failing managed source is logged and the versioned queries are used alone.
#[derive(Debug, Clone)]
pub struct QueryCatalog<R> {
    versioned: VersionedCatalog,
    remote: Option<R>,
}

impl<R> QueryCatalog<R> {
    pub fn new(versioned: VersionedCatalog, remote: Option<R>) -> Self {
        Self { versioned, remote }
    }
}

impl<R> QuerySource for QueryCatalog<R>
where
    R: QuerySource + Sync,
{
    async fn queries(&self, table: &str) -> RelayResult<Vec<QueryDefinition>> {
        let versioned = self.versioned.queries(table).await?;

        let Some(remote) = &self.remote else {
            return Ok(versioned);
        };

        match remote.queries(table).await {
            Ok(remote) => Ok(merge_queries(versioned, remote)),
            Err(err) => {
                warn!(table, error = %err, "remote query catalog unavailable, using versioned queries only");
                Ok(versioned)
            }
        }
    }
}

/// Appends the remote queries whose names the versioned catalog does not already use.
pub fn merge_queries(
    versioned: Vec<QueryDefinition>,
    remote: Vec<QueryDefinition>,
) -> Vec<QueryDefinition> {
    let mut names = versioned
        .iter()
        .map(|definition| definition.name.clone())
        .collect::<HashSet<_>>();

    let mut merged = versioned;
    for definition in remote {
        if names.insert(definition.name.clone()) {
            merged.push(definition);
        }
    }

    merged
}
