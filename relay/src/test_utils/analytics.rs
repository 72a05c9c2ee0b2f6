use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::bail;
use crate::clients::analytics::AnalyticsStore;
use crate::error::{ErrorKind, RelayResult};
use crate::query::windower::{parse_window, source_table};
use crate::types::Record;

#[derive(Debug, Default)]
struct Inner {
    /// Rows per table with their ingestion time.
    tables: BTreeMap<String, Vec<(DateTime<Utc>, Record)>>,
    executed: Vec<String>,
    failing_tables: HashSet<String>,
    unreachable: bool,
}

/// Analytical store over in-memory rows.
///
/// A query returns every row of its source table whose ingestion time lies in the window the
/// query was restricted to, or every row when it carries no window. Other operators are ignored.
#[derive(Debug, Clone, Default)]
pub struct MemoryAnalyticsStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ingest(&self, table: &str, ingested_at: DateTime<Utc>, record: Record) {
        self.inner
            .lock()
            .await
            .tables
            .entry(table.to_owned())
            .or_default()
            .push((ingested_at, record));
    }

    /// Queries run so far, in order.
    pub async fn executed(&self) -> Vec<String> {
        self.inner.lock().await.executed.clone()
    }

    pub async fn fail_table(&self, table: &str) {
        self.inner
            .lock()
            .await
            .failing_tables
            .insert(table.to_owned());
    }

    pub async fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().await.unreachable = unreachable;
    }
}

impl AnalyticsStore for MemoryAnalyticsStore {
    async fn execute_query(&self, query: &str) -> RelayResult<Vec<Record>> {
        let mut inner = self.inner.lock().await;
        if inner.unreachable {
            bail!(ErrorKind::ConnectionFailed, "Analytics store unreachable");
        }
        inner.executed.push(query.to_owned());

        let Some(table) = source_table(query) else {
            bail!(ErrorKind::QueryFailed, "Query has no source table", query);
        };
        if inner.failing_tables.contains(&table) {
            bail!(ErrorKind::QueryFailed, "Injected query failure", table);
        }

        let window = parse_window(query);
        let records = inner
            .tables
            .get(&table)
            .into_iter()
            .flatten()
            .filter(|(ingested_at, _)| window.is_none_or(|window| window.contains(*ingested_at)))
            .map(|(_, record)| record.clone())
            .collect();

        Ok(records)
    }

    async fn check_connectivity(&self) -> RelayResult<()> {
        if self.inner.lock().await.unreachable {
            bail!(ErrorKind::ConnectionFailed, "Analytics store unreachable");
        }

        Ok(())
    }
}
