//! The `config` module loads `fleetlink` settings.
//!
//! Values come from an optional `config/default` file and from `FLEETLINK_`
//! prefixed environment variables (`FLEETLINK_CONNECTION__HEARTBEAT_INTERVAL_MS`),
//! then are merged over `Settings::default()`.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, Environment, File};

pub use config::ConfigError;
pub use settings::{
    ConnectionSettings, DispatcherSettings, LoggingSettings, PublisherSettings, ServerSettings,
    Settings, StorageSettings,
};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config` with an explicit file (extension optional).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("FLEETLINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_with_defaults())
}

#[cfg(test)]
mod tests;
