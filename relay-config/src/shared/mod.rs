mod analytics;
mod base;
mod catalog;
mod credential;
mod relay;
mod retry;
mod run;
mod sink;
mod store;
mod tables;

pub use analytics::*;
pub use base::*;
pub use catalog::*;
pub use credential::*;
pub use relay::*;
pub use retry::*;
pub use run::*;
pub use sink::*;
pub use store::*;
pub use tables::*;
