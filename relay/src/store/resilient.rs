use metrics::counter;
use relay_config::shared::RetryConfig;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, info, warn};

use crate::error::{ErrorKind, RelayResult};
use crate::metrics::{OPERATION, RELAY_STORE_RETRIES_TOTAL};
use crate::store::base::{Entity, KeyValueStore};

/// Retrying front end of a [`KeyValueStore`].
///
/// Retryable failures are repeated with exponential backoff up to `max_attempts` times in total;
/// once attempts run out the last error is returned as [`ErrorKind::RetriesExhausted`], which is
/// terminal. Store answers are turned into values: a duplicate insert is a success and a missing
/// entity on read is `None`. Concurrency conflicts are never retried; see [`Self::update`] for the
/// one case where a conflict is resolved instead of returned.
#[derive(Debug, Clone)]
pub struct ResilientClient<S> {
    store: S,
    retry: RetryConfig,
}

impl<S> ResilientClient<S>
where
    S: KeyValueStore + Sync,
{
    pub fn new(store: S, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    async fn with_retries<T, F, Fut>(&self, operation: &'static str, mut call: F) -> RelayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            attempt += 1;
            if attempt >= max_attempts {
                error!(operation, attempts = attempt, error = %err, "store call failed on every attempt");
                return Err(err.reclassify(
                    ErrorKind::RetriesExhausted,
                    "Store call failed on every attempt",
                ));
            }

            let delay = self.retry.delay_for_attempt(attempt - 1);
            warn!(operation, attempt, ?delay, error = %err, "store call failed, retrying");
            counter!(RELAY_STORE_RETRIES_TOTAL, OPERATION => operation).increment(1);

            tokio::time::sleep(delay).await;
        }
    }

    /// Creates `table`, treating an existing table as success.
    pub async fn ensure_table(&self, table: &str) -> RelayResult<()> {
        match self
            .with_retries("create_table", || self.store.create_table(table))
            .await
        {
            Err(err) if err.kind() == ErrorKind::EntityAlreadyExists => Ok(()),
            result => result,
        }
    }

    /// Inserts `entity`. Returns `None` when an entity with the same keys already existed.
    pub async fn insert(&self, table: &str, entity: Entity) -> RelayResult<Option<Entity>> {
        match self
            .with_retries("insert_entity", || {
                self.store.insert_entity(table, entity.clone())
            })
            .await
        {
            Ok(entity) => Ok(Some(entity)),
            Err(err) if err.kind() == ErrorKind::EntityAlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn upsert(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        self.with_retries("upsert_entity", || {
            self.store.upsert_entity(table, entity.clone())
        })
        .await
    }

    /// Conditionally replaces `entity`. A version mismatch surfaces as
    /// [`ErrorKind::ConcurrencyConflict`].
    ///
    /// A retried write can conflict with itself: the store applied an earlier attempt but its
    /// answer was lost, so the version tag no longer matches. When a retry conflicts, the stored
    /// entity is read back and, if it already holds every written property, returned as the
    /// outcome of the update.
    pub async fn update(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        let attempts = AtomicU32::new(0);
        let result = self
            .with_retries("update_entity", || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.store.update_entity(table, entity.clone())
            })
            .await;

        match result {
            Err(err)
                if err.kind() == ErrorKind::ConcurrencyConflict
                    && attempts.load(Ordering::Relaxed) > 1 =>
            {
                match self.get(table, &entity.partition_key, &entity.row_key).await? {
                    Some(stored) if holds_properties(&stored, &entity) => {
                        info!(
                            table,
                            row_key = %entity.row_key,
                            "earlier update attempt was applied, adopting stored entity"
                        );
                        Ok(stored)
                    }
                    _ => Err(err),
                }
            }
            result => result,
        }
    }

    pub async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> RelayResult<Option<Entity>> {
        match self
            .with_retries("get_entity", || {
                self.store.get_entity(table, partition_key, row_key)
            })
            .await
        {
            Ok(entity) => Ok(Some(entity)),
            Err(err) if err.kind() == ErrorKind::EntityNotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn query(&self, table: &str, partition_key: &str) -> RelayResult<Vec<Entity>> {
        self.with_retries("query_partition", || {
            self.store.query_partition(table, partition_key)
        })
        .await
    }
}

fn holds_properties(stored: &Entity, written: &Entity) -> bool {
    written
        .properties
        .iter()
        .all(|(name, value)| stored.properties.get(name) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryKeyValueStore;
    use crate::test_utils::store::FaultyStore;
    use std::time::Duration;
    use tokio::time::Instant;

    fn faulty() -> (FaultyStore<MemoryKeyValueStore>, ResilientClient<FaultyStore<MemoryKeyValueStore>>) {
        let store = FaultyStore::wrap(MemoryKeyValueStore::new());
        let client = ResilientClient::new(store.clone(), RetryConfig::default());
        (store, client)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let (store, client) = faulty();
        client.ensure_table("t").await.unwrap();
        store.fail_next(2, ErrorKind::ServiceUnavailable).await;

        let started = Instant::now();
        let entity = client.upsert("t", Entity::new("p", "r")).await.unwrap();

        assert!(entity.etag.is_some());
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_terminal() {
        let (store, client) = faulty();
        client.ensure_table("t").await.unwrap();
        store.fail_next(3, ErrorKind::Timeout).await;

        let err = client.query("t", "p").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert!(!err.is_retryable());
        assert_eq!(store.calls().await, 4);
    }

    #[tokio::test]
    async fn existing_entities_and_tables_are_success() {
        let (_, client) = faulty();
        client.ensure_table("t").await.unwrap();
        client.ensure_table("t").await.unwrap();

        assert!(client.insert("t", Entity::new("p", "r")).await.unwrap().is_some());
        assert!(client.insert("t", Entity::new("p", "r")).await.unwrap().is_none());
        assert!(client.get("t", "p", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflicts_are_not_retried() {
        let (store, client) = faulty();
        client.ensure_table("t").await.unwrap();
        let stale = client.insert("t", Entity::new("p", "r")).await.unwrap().unwrap();
        client.update("t", stale.clone()).await.unwrap();

        let calls_before = store.calls().await;
        let err = client.update("t", stale).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
        assert_eq!(store.calls().await, calls_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn applied_update_with_a_lost_answer_is_adopted() {
        let (store, client) = faulty();
        client.ensure_table("t").await.unwrap();
        let inserted = client.insert("t", Entity::new("p", "r")).await.unwrap().unwrap();
        let mut changed = inserted.clone();
        changed.set("Status", "Processing");
        store.lose_next_update_answers(1).await;

        let updated = client.update("t", changed).await.unwrap();

        let stored = client.get("t", "p", "r").await.unwrap().unwrap();
        assert_eq!(updated.etag, stored.etag);
        assert_eq!(stored.get_str("Status"), Some("Processing"));
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_after_a_retry_with_foreign_changes_is_reported() {
        let (store, client) = faulty();
        client.ensure_table("t").await.unwrap();
        let inserted = client.insert("t", Entity::new("p", "r")).await.unwrap().unwrap();

        let mut other = inserted.clone();
        other.set("Status", "Error");
        client.update("t", other).await.unwrap();

        let mut ours = inserted;
        ours.set("Status", "Processing");
        store.fail_next(1, ErrorKind::Timeout).await;

        let err = client.update("t", ours).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
    }
}
