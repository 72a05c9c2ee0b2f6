pub mod chunking;
pub mod router;
pub mod schema;
