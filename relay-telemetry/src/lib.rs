//! Logging and metrics set-up shared by the relay binaries and tests.

pub mod metrics;
pub mod tracing;

pub use crate::tracing::{
    LogFlusher, TracingError, init_test_tracing, init_tracing, set_global_run_id,
};
