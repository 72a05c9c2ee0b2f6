use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clients::event_stream::{EventStreamClient, EventStreamTarget};
use crate::clients::log_ingestion::{LogIngestionClient, LogIngestionTarget};
use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;
use crate::types::Record;

#[derive(Debug, Default)]
struct Faults {
    next: u32,
    next_kind: Option<ErrorKind>,
    /// Destinations that fail on every call.
    always: HashMap<String, ErrorKind>,
    attempts: u64,
}

impl Faults {
    fn enter(&mut self, destination: &str) -> RelayResult<()> {
        self.attempts += 1;

        if let Some(kind) = self.always.get(destination) {
            return Err(relay_error!(*kind, "Injected sink fault", destination));
        }

        if self.next > 0 {
            self.next -= 1;
            let kind = self.next_kind.unwrap_or(ErrorKind::Unknown);
            return Err(relay_error!(kind, "Injected sink fault", destination));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct LogIngestionInner {
    uploads: Vec<(LogIngestionTarget, Vec<Record>)>,
    faults: Faults,
}

/// Log-ingestion client that keeps every successful upload.
#[derive(Debug, Clone, Default)]
pub struct RecordingLogIngestion {
    inner: Arc<Mutex<LogIngestionInner>>,
}

impl RecordingLogIngestion {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn uploads(&self) -> Vec<(LogIngestionTarget, Vec<Record>)> {
        self.inner.lock().await.uploads.clone()
    }

    /// Successfully uploaded records of one stream, in upload order.
    pub async fn records_for(&self, stream: &str) -> Vec<Record> {
        self.inner
            .lock()
            .await
            .uploads
            .iter()
            .filter(|(target, _)| target.stream == stream)
            .flat_map(|(_, records)| records.iter().cloned())
            .collect()
    }

    /// Calls made so far, failed ones included.
    pub async fn attempts(&self) -> u64 {
        self.inner.lock().await.faults.attempts
    }

    /// Fails the next `count` uploads, whatever their stream.
    pub async fn fail_next(&self, count: u32, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.faults.next = count;
        inner.faults.next_kind = Some(kind);
    }

    /// Fails every upload to `stream`.
    pub async fn fail_stream(&self, stream: &str, kind: ErrorKind) {
        self.inner
            .lock()
            .await
            .faults
            .always
            .insert(stream.to_owned(), kind);
    }
}

impl LogIngestionClient for RecordingLogIngestion {
    async fn upload(&self, target: &LogIngestionTarget, records: &[Record]) -> RelayResult<()> {
        let mut inner = self.inner.lock().await;
        inner.faults.enter(&target.stream)?;
        inner.uploads.push((target.clone(), records.to_vec()));

        Ok(())
    }
}

#[derive(Debug, Default)]
struct EventStreamInner {
    messages: Vec<(EventStreamTarget, String)>,
    faults: Faults,
}

/// Event stream client that keeps every successfully published message.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventStream {
    inner: Arc<Mutex<EventStreamInner>>,
}

impl RecordingEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<(EventStreamTarget, String)> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn attempts(&self) -> u64 {
        self.inner.lock().await.faults.attempts
    }

    pub async fn fail_next(&self, count: u32, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.faults.next = count;
        inner.faults.next_kind = Some(kind);
    }
}

impl EventStreamClient for RecordingEventStream {
    async fn publish(&self, target: &EventStreamTarget, payload: String) -> RelayResult<()> {
        let mut inner = self.inner.lock().await;
        inner.faults.enter(&target.name)?;
        inner.messages.push((target.clone(), payload));

        Ok(())
    }
}
