//! Configuration management for the relay.
//!
//! Provides environment detection, layered configuration loading from YAML files and
//! environment variables, secret handling, and the typed settings shared by the relay
//! engine and its runner binary.

mod environment;
mod load;
mod secret;
pub mod shared;

pub use environment::*;
pub use load::*;
pub use secret::*;
