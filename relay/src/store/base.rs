use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;

use crate::bail;
use crate::error::{ErrorKind, RelayResult};

/// A row of the key-value table service.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub partition_key: String,
    pub row_key: String,
    /// Version tag returned by the store. `None` for entities not read from a store.
    pub etag: Option<String>,
    pub properties: serde_json::Map<String, Value>,
}

impl Entity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            etag: None,
            properties: serde_json::Map::new(),
        }
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    /// Sets a property. `None` values are stored as JSON null.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.properties.insert(name.to_owned(), value.into());
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }

    /// Reads an RFC 3339 timestamp property; missing, null and empty values are `None`.
    pub fn get_datetime(&self, name: &str) -> RelayResult<Option<DateTime<Utc>>> {
        match self.properties.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) if value.is_empty() => Ok(None),
            Some(Value::String(value)) => Ok(Some(
                DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc),
            )),
            Some(other) => bail!(
                ErrorKind::DeserializationError,
                "Timestamp property is not a string",
                format!("{name} = {other}")
            ),
        }
    }
}

/// Raw access to a key-value table service.
///
/// Implementations report store outcomes through error kinds: a missing entity is
/// [`ErrorKind::EntityNotFound`], a duplicate insert or table is [`ErrorKind::EntityAlreadyExists`]
/// and a failed conditional write is [`ErrorKind::ConcurrencyConflict`]. Turning those into values
/// and retrying transient failures is the job of [`crate::store::resilient::ResilientClient`].
pub trait KeyValueStore {
    fn create_table(&self, table: &str) -> impl Future<Output = RelayResult<()>> + Send;

    /// Inserts a new entity and returns it with its version tag.
    fn insert_entity(
        &self,
        table: &str,
        entity: Entity,
    ) -> impl Future<Output = RelayResult<Entity>> + Send;

    /// Inserts or fully replaces an entity, ignoring any version tag.
    fn upsert_entity(
        &self,
        table: &str,
        entity: Entity,
    ) -> impl Future<Output = RelayResult<Entity>> + Send;

    /// Replaces an existing entity only if its stored version still matches `entity.etag`.
    ///
    /// An entity without a version tag matches any stored version.
    fn update_entity(
        &self,
        table: &str,
        entity: Entity,
    ) -> impl Future<Output = RelayResult<Entity>> + Send;

    fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> impl Future<Output = RelayResult<Entity>> + Send;

    /// Returns every entity of a partition.
    fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> impl Future<Output = RelayResult<Vec<Entity>>> + Send;
}
