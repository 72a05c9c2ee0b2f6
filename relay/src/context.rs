use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::RelayError;

/// A table failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableFailure {
    pub table_name: String,
    pub cycle: u64,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// State shared by everything working on behalf of one run.
///
/// Created by the supervisor and passed down by reference, so failures are attributed to the
/// run that produced them without any process wide bookkeeping.
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    deadline: DateTime<Utc>,
    failures: Mutex<Vec<TableFailure>>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            deadline,
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub async fn record_error(
        &self,
        table_name: &str,
        cycle: u64,
        error: &RelayError,
        at: DateTime<Utc>,
    ) {
        self.record_failure(TableFailure {
            table_name: table_name.to_owned(),
            cycle,
            kind: format!("{:?}", error.kind()),
            message: error.to_string(),
            at,
        })
        .await;
    }

    pub async fn record_failure(&self, failure: TableFailure) {
        self.failures.lock().await.push(failure);
    }

    pub async fn failures(&self) -> Vec<TableFailure> {
        self.failures.lock().await.clone()
    }
}
