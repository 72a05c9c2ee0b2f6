pub mod classifier;
pub mod clients;
pub mod clock;
pub mod concurrency;
pub mod context;
pub mod delivery;
pub mod error;
mod macros;
pub mod metrics;
pub mod query;
pub mod store;
pub mod supervisor;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
