pub mod activity;
pub mod processor;
