use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;
use crate::store::base::{Entity, KeyValueStore};

#[derive(Debug)]
struct Faults {
    remaining: u32,
    kind: ErrorKind,
    lost_update_answers: u32,
    calls: u64,
}

/// Wraps a store and fails a configurable number of upcoming calls.
#[derive(Debug, Clone)]
pub struct FaultyStore<S> {
    store: S,
    faults: Arc<Mutex<Faults>>,
}

impl<S> FaultyStore<S> {
    pub fn wrap(store: S) -> Self {
        Self {
            store,
            faults: Arc::new(Mutex::new(Faults {
                remaining: 0,
                kind: ErrorKind::Unknown,
                lost_update_answers: 0,
                calls: 0,
            })),
        }
    }

    /// Makes the next `count` calls, of any operation, fail with `kind`.
    pub async fn fail_next(&self, count: u32, kind: ErrorKind) {
        let mut faults = self.faults.lock().await;
        faults.remaining = count;
        faults.kind = kind;
    }

    /// Makes the next `count` updates reach the store and then fail with a timeout, as if the
    /// answer was lost on the way back.
    pub async fn lose_next_update_answers(&self, count: u32) {
        self.faults.lock().await.lost_update_answers = count;
    }

    /// Number of calls made so far, failed ones included.
    pub async fn calls(&self) -> u64 {
        self.faults.lock().await.calls
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    async fn enter(&self) -> RelayResult<()> {
        let mut faults = self.faults.lock().await;
        faults.calls += 1;
        if faults.remaining > 0 {
            faults.remaining -= 1;
            return Err(relay_error!(faults.kind, "Injected store fault"));
        }

        Ok(())
    }
}

impl<S> KeyValueStore for FaultyStore<S>
where
    S: KeyValueStore + Send + Sync,
{
    async fn create_table(&self, table: &str) -> RelayResult<()> {
        self.enter().await?;
        self.store.create_table(table).await
    }

    async fn insert_entity(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        self.enter().await?;
        self.store.insert_entity(table, entity).await
    }

    async fn upsert_entity(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        self.enter().await?;
        self.store.upsert_entity(table, entity).await
    }

    async fn update_entity(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        self.enter().await?;
        let updated = self.store.update_entity(table, entity).await?;

        let mut faults = self.faults.lock().await;
        if faults.lost_update_answers > 0 {
            faults.lost_update_answers -= 1;
            return Err(relay_error!(ErrorKind::Timeout, "Injected lost store answer"));
        }

        Ok(updated)
    }

    async fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> RelayResult<Entity> {
        self.enter().await?;
        self.store.get_entity(table, partition_key, row_key).await
    }

    async fn query_partition(&self, table: &str, partition_key: &str) -> RelayResult<Vec<Entity>> {
        self.enter().await?;
        self.store.query_partition(table, partition_key).await
    }
}
