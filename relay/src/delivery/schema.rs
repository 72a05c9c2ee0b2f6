use std::collections::BTreeMap;

use crate::types::Record;

/// Fields the log-ingestion endpoint manages itself and rejects when they are sent.
const RESERVED_FIELDS: &[&str] = &[
    "TenantId",
    "Type",
    "SourceSystem",
    "MG",
    "ManagementGroupName",
];

/// Optional ordered field allow-lists, keyed by table name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    allow_lists: BTreeMap<String, Vec<String>>,
}

impl SchemaRegistry {
    pub fn new(allow_lists: BTreeMap<String, Vec<String>>) -> Self {
        Self { allow_lists }
    }

    pub fn allow_list(&self, table: &str) -> Option<&[String]> {
        self.allow_lists.get(table).map(Vec::as_slice)
    }

    /// Shapes `record` for log ingestion into `table`.
    ///
    /// Returns `None` when no field is left to send.
    pub fn prepare(&self, table: &str, record: Record) -> Option<Record> {
        prepare_record(record, self.allow_list(table))
    }
}

/// Internal store fields are system columns (leading underscore) or in [`RESERVED_FIELDS`].
pub fn is_reserved_field(name: &str) -> bool {
    name.starts_with('_') || RESERVED_FIELDS.contains(&name)
}

/// Drops reserved fields, then keeps only allow-listed fields in allow-list order.
pub fn prepare_record(mut record: Record, allow_list: Option<&[String]>) -> Option<Record> {
    record.retain(|name, _| !is_reserved_field(name));

    let record = match allow_list {
        Some(allow_list) => allow_list
            .iter()
            .filter_map(|name| record.remove(name).map(|value| (name.clone(), value)))
            .collect(),
        None => record,
    };

    (!record.is_empty()).then_some(record)
}
