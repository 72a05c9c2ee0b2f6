use serde::{Deserialize, Serialize};

/// Prefix marking a configuration entry as a table to relay.
///
/// An entry `TABLE_SINK_Orders=orders-sink` declares the table `Orders` routed to the sink
/// `orders-sink`.
pub const TABLE_SINK_PREFIX: &str = "TABLE_SINK_";

/// A table to relay and the sink it is routed to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableSinkMapping {
    pub table_name: String,
    pub sink_id: String,
}

/// Resolves table mappings from prefixed key/value entries.
///
/// Entries without the prefix, with an empty table name or with an empty sink are ignored. When
/// the same table appears twice the last entry wins. The result is sorted by table name.
pub fn discover_tables<I, K, V>(entries: I, prefix: &str) -> Vec<TableSinkMapping>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut tables = std::collections::BTreeMap::new();

    for (key, value) in entries {
        let Some(table_name) = key.as_ref().strip_prefix(prefix) else {
            continue;
        };

        let table_name = table_name.trim();
        let sink_id = value.as_ref().trim();
        if table_name.is_empty() || sink_id.is_empty() {
            continue;
        }

        tables.insert(table_name.to_owned(), sink_id.to_owned());
    }

    tables
        .into_iter()
        .map(|(table_name, sink_id)| TableSinkMapping {
            table_name,
            sink_id,
        })
        .collect()
}

/// Resolves table mappings from the process environment.
pub fn discover_tables_from_env() -> Vec<TableSinkMapping> {
    discover_tables(std::env::vars(), TABLE_SINK_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_prefixed_entries_only() {
        let entries = vec![
            ("TABLE_SINK_Orders", "sink-a"),
            ("TABLE_SINK_Audit", "sink-b"),
            ("OTHER_SETTING", "x"),
            ("TABLE_SINK_", "sink-c"),
            ("TABLE_SINK_Empty", " "),
        ];

        let tables = discover_tables(entries, TABLE_SINK_PREFIX);

        assert_eq!(
            tables,
            vec![
                TableSinkMapping {
                    table_name: "Audit".to_owned(),
                    sink_id: "sink-b".to_owned()
                },
                TableSinkMapping {
                    table_name: "Orders".to_owned(),
                    sink_id: "sink-a".to_owned()
                },
            ]
        );
    }

    #[test]
    fn no_entries_yields_empty_list() {
        let tables = discover_tables(Vec::<(String, String)>::new(), TABLE_SINK_PREFIX);
        assert!(tables.is_empty());
    }
}
