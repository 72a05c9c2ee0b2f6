use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ErrorKind, RelayResult};
use crate::metrics::{RELAY_CLAIM_CONFLICTS_TOTAL, TABLE};
use crate::relay_error;
use crate::store::base::{Entity, KeyValueStore};
use crate::store::resilient::ResilientClient;
use crate::types::{QueueStatus, TableQueueEntry, TableSpec};

/// All queue entries live in one partition so a single query lists the whole queue.
const QUEUE_PARTITION: &str = "tables";

const SINK_ID: &str = "SinkId";
const STATUS: &str = "Status";
const LAST_PROCESSED_AT: &str = "LastProcessedAt";
const PROCESSING_OWNER: &str = "ProcessingOwner";
const LAST_UPDATED_AT: &str = "LastUpdatedAt";

/// How a claimed entry is handed back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The table was processed; it goes to the back of the rotation.
    Succeeded,
    /// The table failed. The entry is marked `Error` but stays claimable, and
    /// `last_processed_at` is set to the release time rather than an earlier value, which puts
    /// it at the back of the rotation so a persistently failing table cannot crowd out the
    /// others.
    Failed,
    /// The table was not processed; its position in the rotation is kept.
    Deferred,
}

/// Crash tolerant round-robin queue of tables, stored in the key-value table service.
///
/// Every mutation is a single-entity conditional write, so two processors racing for the same
/// entry cannot both own it. Losing a race is not an error: the claim simply reports that no
/// entry was available.
#[derive(Debug, Clone)]
pub struct WorkQueueStore<S> {
    client: ResilientClient<S>,
    table: String,
}

impl<S> WorkQueueStore<S>
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

    /// Writes one `Available` entry per table.
    ///
    /// Seeding is an upsert and can be repeated: entries left `Processing` or `Error` by an earlier
    /// run are reset and their owner is cleared, while `last_processed_at` is kept so the rotation
    /// order survives between runs.
    pub async fn seed(&self, tables: &[TableSpec], now: DateTime<Utc>) -> RelayResult<usize> {
        for table in tables {
            let previous = self
                .client
                .get(&self.table, QUEUE_PARTITION, &table.table_name)
                .await?
                .map(|entity| entry_from_entity(&entity))
                .transpose()?;

            let entry = TableQueueEntry {
                table_name: table.table_name.clone(),
                sink_id: table.sink_id.clone(),
                status: QueueStatus::Available,
                last_processed_at: previous.and_then(|entry| entry.last_processed_at),
                processing_owner: None,
                last_updated_at: now,
                etag: None,
            };

            self.client.upsert(&self.table, entry_to_entity(&entry)).await?;
        }

        info!(tables = tables.len(), queue = %self.table, "work queue seeded");

        Ok(tables.len())
    }

    /// Lists every entry of the queue, ordered by table name.
    pub async fn entries(&self) -> RelayResult<Vec<TableQueueEntry>> {
        let mut entries = self
            .client
            .query(&self.table, QUEUE_PARTITION)
            .await?
            .iter()
            .map(entry_from_entity)
            .collect::<RelayResult<Vec<_>>>()?;
        entries.sort_by(|a, b| a.table_name.cmp(&b.table_name));

        Ok(entries)
    }

    /// Claims the claimable entry processed longest ago, never-processed entries first.
    ///
    /// Returns `None` when nothing is claimable or another owner won the race for the entry.
    pub async fn claim_next(
        &self,
        owner: &str,
        now: DateTime<Utc>,
    ) -> RelayResult<Option<TableQueueEntry>> {
        let Some(mut candidate) = self
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.status.is_claimable())
            .min_by_key(|entry| entry.last_processed_at)
        else {
            return Ok(None);
        };

        candidate.status = QueueStatus::Processing;
        candidate.processing_owner = Some(owner.to_owned());
        candidate.last_updated_at = now;

        match self
            .client
            .update(&self.table, entry_to_entity(&candidate))
            .await
        {
            Ok(entity) => {
                candidate.etag = entity.etag;
                debug!(table = %candidate.table_name, owner, "claimed queue entry");

                Ok(Some(candidate))
            }
            Err(err) if err.kind() == ErrorKind::ConcurrencyConflict => {
                debug!(table = %candidate.table_name, owner, "lost claim race");
                counter!(RELAY_CLAIM_CONFLICTS_TOTAL, TABLE => candidate.table_name).increment(1);

                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Hands a claimed entry back and clears its owner.
    pub async fn release(
        &self,
        mut entry: TableQueueEntry,
        release: Release,
        now: DateTime<Utc>,
    ) -> RelayResult<TableQueueEntry> {
        match release {
            Release::Succeeded => {
                entry.status = QueueStatus::Available;
                entry.last_processed_at = Some(now);
            }
            Release::Failed => {
                entry.status = QueueStatus::Error;
                entry.last_processed_at = Some(now);
            }
            Release::Deferred => {
                entry.status = QueueStatus::Available;
            }
        }
        entry.processing_owner = None;
        entry.last_updated_at = now;

        let entity = self
            .client
            .update(&self.table, entry_to_entity(&entry))
            .await?;
        entry.etag = entity.etag;

        Ok(entry)
    }
}

fn entry_to_entity(entry: &TableQueueEntry) -> Entity {
    let mut entity =
        Entity::new(QUEUE_PARTITION, &entry.table_name).with_etag(entry.etag.clone());
    entity.set(SINK_ID, entry.sink_id.clone());
    entity.set(STATUS, entry.status.as_str());
    entity.set(
        LAST_PROCESSED_AT,
        entry
            .last_processed_at
            .map(|at| Value::String(at.to_rfc3339()))
            .unwrap_or(Value::Null),
    );
    entity.set(
        PROCESSING_OWNER,
        entry
            .processing_owner
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    entity.set(LAST_UPDATED_AT, entry.last_updated_at.to_rfc3339());

    entity
}

fn entry_from_entity(entity: &Entity) -> RelayResult<TableQueueEntry> {
    let status = entity
        .get_str(STATUS)
        .ok_or_else(|| {
            relay_error!(
                ErrorKind::DeserializationError,
                "Queue entry has no status",
                &entity.row_key
            )
        })?
        .parse()?;

    Ok(TableQueueEntry {
        table_name: entity.row_key.clone(),
        sink_id: entity.get_str(SINK_ID).unwrap_or_default().to_owned(),
        status,
        last_processed_at: entity.get_datetime(LAST_PROCESSED_AT)?,
        processing_owner: entity
            .get_str(PROCESSING_OWNER)
            .filter(|owner| !owner.is_empty())
            .map(str::to_owned),
        last_updated_at: entity
            .get_datetime(LAST_UPDATED_AT)?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        etag: entity.etag.clone(),
    })
}
