use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::query::catalog::QueryDefinition;
use crate::types::Record;

/// Parses an RFC 3339 timestamp, panicking on bad input.
pub fn utc(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .expect("fixture timestamp is RFC 3339")
        .with_timezone(&Utc)
}

/// Turns a JSON object literal into a record.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture record must be a JSON object, got {other}"),
    }
}

pub fn query(name: &str, text: &str) -> QueryDefinition {
    QueryDefinition {
        name: name.to_owned(),
        description: format!("{name} fixture query"),
        query: text.to_owned(),
    }
}
