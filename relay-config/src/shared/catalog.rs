use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One filter query of the versioned catalog.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryDefinitionConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query: String,
}

/// Query and schema catalogs shipped with the deployment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Versioned queries keyed by table name.
    pub queries: BTreeMap<String, Vec<QueryDefinitionConfig>>,
    /// Optional managed query source merged with the versioned queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_catalog_url: Option<String>,
    /// Optional ordered field allow-lists keyed by table name.
    pub schemas: BTreeMap<String, Vec<String>>,
}
