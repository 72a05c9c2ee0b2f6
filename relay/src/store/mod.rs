pub mod base;
pub mod checkpoint;
pub mod memory;
pub mod queue;
pub mod resilient;
pub mod table_service;
