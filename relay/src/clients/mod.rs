pub mod analytics;
pub mod credentials;
pub mod event_stream;
pub mod log_ingestion;
