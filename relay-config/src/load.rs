use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory containing configuration files relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Base configuration file loaded for all environments.
const BASE_CONFIG_FILE: &str = "base.yaml";

/// Prefix for environment variable configuration overrides.
const ENV_PREFIX: &str = "APP";

const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
///
/// Example: `APP_RUN__MAX_CYCLES` sets the `run.max_cycles` field.
const ENV_SEPARATOR: &str = "__";

const LIST_SEPARATOR: &str = ",";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to determine the configuration directory: {0}")]
    WorkingDirectory(#[from] std::io::Error),

    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
}

/// Keys that must be parsed as lists when they come from environment variables.
pub trait Config {
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Loads configuration from `./configuration` for the environment in `APP_ENVIRONMENT`.
///
/// Sources are layered in this order, later ones overriding earlier ones:
/// 1. `configuration/base.yaml`
/// 2. `configuration/{environment}.yaml`, if present
/// 3. `APP_`-prefixed environment variables, nested with `__`
pub fn load_config<T>() -> Result<T, LoadError>
where
    T: Config + DeserializeOwned,
{
    let configuration_directory = std::env::current_dir()?.join(CONFIGURATION_DIR);
    let environment = Environment::load()?;

    load_config_from(&configuration_directory, environment)
}

/// Loads configuration from an explicit directory and environment.
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadError>
where
    T: Config + DeserializeOwned,
{
    let base_file: PathBuf = directory.join(BASE_CONFIG_FILE);
    let environment_file: PathBuf = directory.join(environment.config_file_name());

    let mut environment_source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true);

    if !<T as Config>::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source.list_separator(LIST_SEPARATOR);

        for key in <T as Config>::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    let settings = config::Config::builder()
        .add_source(config::File::from(base_file))
        .add_source(config::File::from(environment_file).required(false))
        .add_source(environment_source)
        .build()?;

    Ok(settings.try_deserialize::<T>()?)
}
