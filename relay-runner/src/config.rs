use relay::types::TableSpec;
use relay_config::load_config;
use relay_config::shared::{RelayConfig, discover_tables_from_env};
use std::collections::BTreeMap;

/// Loads the [`RelayConfig`] and validates it.
pub fn load_relay_config() -> anyhow::Result<RelayConfig> {
    let config = load_config::<RelayConfig>()?;
    config.validate()?;

    Ok(config)
}

/// Tables declared in the configuration settings, overridden by `TABLE_SINK_*` variables of the
/// process environment.
pub fn resolve_tables(config: &RelayConfig) -> Vec<TableSpec> {
    let mut tables = BTreeMap::new();
    for mapping in config
        .declared_tables()
        .into_iter()
        .chain(discover_tables_from_env())
    {
        tables.insert(mapping.table_name.clone(), TableSpec::from(mapping));
    }

    tables.into_values().collect()
}

