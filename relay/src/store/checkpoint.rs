use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::error::RelayResult;
use crate::store::base::{Entity, KeyValueStore};
use crate::store::resilient::ResilientClient;
use crate::types::WindowCheckpoint;

const CHECKPOINT_PARTITION: &str = "checkpoints";
const LAST_RUN_TIME: &str = "LastRunTime";

/// Per-table window checkpoints in the key-value table service.
#[derive(Debug, Clone)]
pub struct CheckpointStore<S> {
    client: ResilientClient<S>,
    table: String,
}

impl<S> CheckpointStore<S>
where
    S: KeyValueStore + Sync,
{
    pub fn new(client: ResilientClient<S>, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    pub async fn initialize(&self) -> RelayResult<()> {
        self.client.ensure_table(&self.table).await
    }

    /// Returns the checkpoint of `entity_name`, creating it on first access.
    ///
    /// A new checkpoint starts `max_window` before `now`. An existing one older than that is
    /// clamped forward, so no window handed out is longer than `max_window`.
    pub async fn load(
        &self,
        entity_name: &str,
        now: DateTime<Utc>,
        max_window: TimeDelta,
    ) -> RelayResult<WindowCheckpoint> {
        let floor = now - max_window;

        let stored = match self
            .client
            .get(&self.table, CHECKPOINT_PARTITION, entity_name)
            .await?
        {
            Some(entity) => entity.get_datetime(LAST_RUN_TIME)?,
            None => None,
        };

        let last_run_time = match stored {
            Some(stored) => stored.max(floor),
            None => {
                debug!(entity = entity_name, start = %floor, "creating window checkpoint");
                self.client
                    .insert(&self.table, checkpoint_entity(entity_name, floor))
                    .await?;
                floor
            }
        };

        Ok(WindowCheckpoint {
            entity_name: entity_name.to_owned(),
            last_run_time,
        })
    }

    /// Moves the checkpoint of `entity_name` to `last_run_time`.
    pub async fn commit(&self, entity_name: &str, last_run_time: DateTime<Utc>) -> RelayResult<()> {
        self.client
            .upsert(&self.table, checkpoint_entity(entity_name, last_run_time))
            .await?;

        Ok(())
    }
}

fn checkpoint_entity(entity_name: &str, last_run_time: DateTime<Utc>) -> Entity {
    let mut entity = Entity::new(CHECKPOINT_PARTITION, entity_name);
    entity.set(LAST_RUN_TIME, last_run_time.to_rfc3339());
    entity
}
