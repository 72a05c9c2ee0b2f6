//! In-memory collaborators and fixtures shared by unit and integration tests.

pub mod analytics;
pub mod credentials;
pub mod fixtures;
pub mod http;
pub mod sinks;
pub mod store;
