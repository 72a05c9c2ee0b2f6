use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;
use crate::store::base::{Entity, KeyValueStore};

type EntityKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<EntityKey, Entity>>,
    version: u64,
}

impl Inner {
    fn table_mut(&mut self, table: &str) -> RelayResult<&mut BTreeMap<EntityKey, Entity>> {
        self.tables.get_mut(table).ok_or_else(|| {
            relay_error!(ErrorKind::EntityNotFound, "Table does not exist", table)
        })
    }

    fn next_etag(&mut self) -> String {
        self.version += 1;
        format!("W/\"{}\"", self.version)
    }

    fn store(&mut self, table: &str, mut entity: Entity) -> RelayResult<Entity> {
        entity.etag = Some(self.next_etag());
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        self.table_mut(table)?.insert(key, entity.clone());

        Ok(entity)
    }
}

/// In-process key-value store with the same conditional-write semantics as the table service.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    async fn create_table(&self, table: &str) -> RelayResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.tables.contains_key(table) {
            return Err(relay_error!(
                ErrorKind::EntityAlreadyExists,
                "Table already exists",
                table
            ));
        }

        inner.tables.insert(table.to_owned(), BTreeMap::new());

        Ok(())
    }

    async fn insert_entity(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        let mut inner = self.inner.lock().await;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        if inner.table_mut(table)?.contains_key(&key) {
            return Err(relay_error!(
                ErrorKind::EntityAlreadyExists,
                "Entity already exists",
                format!("{}/{}", key.0, key.1)
            ));
        }

        inner.store(table, entity)
    }

    async fn upsert_entity(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        let mut inner = self.inner.lock().await;
        inner.store(table, entity)
    }

    async fn update_entity(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        let mut inner = self.inner.lock().await;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        let stored = inner.table_mut(table)?.get(&key).ok_or_else(|| {
            relay_error!(
                ErrorKind::EntityNotFound,
                "Entity does not exist",
                format!("{}/{}", key.0, key.1)
            )
        })?;

        if let Some(expected) = &entity.etag
            && stored.etag.as_ref() != Some(expected)
        {
            return Err(relay_error!(
                ErrorKind::ConcurrencyConflict,
                "Entity was modified concurrently",
                format!("{}/{}", key.0, key.1)
            ));
        }

        inner.store(table, entity)
    }

    async fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> RelayResult<Entity> {
        let mut inner = self.inner.lock().await;
        let key = (partition_key.to_owned(), row_key.to_owned());

        inner.table_mut(table)?.get(&key).cloned().ok_or_else(|| {
            relay_error!(
                ErrorKind::EntityNotFound,
                "Entity does not exist",
                format!("{partition_key}/{row_key}")
            )
        })
    }

    async fn query_partition(&self, table: &str, partition_key: &str) -> RelayResult<Vec<Entity>> {
        let mut inner = self.inner.lock().await;

        Ok(inner
            .table_mut(table)?
            .values()
            .filter(|entity| entity.partition_key == partition_key)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_etag_is_a_conflict() {
        let store = MemoryKeyValueStore::new();
        store.create_table("t").await.unwrap();

        let first = store.insert_entity("t", Entity::new("p", "r")).await.unwrap();
        let second = store.update_entity("t", first.clone()).await.unwrap();
        assert_ne!(first.etag, second.etag);

        let err = store.update_entity("t", first).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
    }

    #[tokio::test]
    async fn duplicate_insert_and_missing_get_are_reported() {
        let store = MemoryKeyValueStore::new();
        store.create_table("t").await.unwrap();
        assert_eq!(
            store.create_table("t").await.unwrap_err().kind(),
            ErrorKind::EntityAlreadyExists
        );

        store.insert_entity("t", Entity::new("p", "r")).await.unwrap();
        assert_eq!(
            store
                .insert_entity("t", Entity::new("p", "r"))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::EntityAlreadyExists
        );
        assert_eq!(
            store.get_entity("t", "p", "x").await.unwrap_err().kind(),
            ErrorKind::EntityNotFound
        );
    }
}
