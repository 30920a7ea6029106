mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BusSettings, ClientSettings, LoggingSettings, ReconnectSettings, ServerSettings, Settings,
    StoreSettings,
};

/// Loads the configuration from `config/default.*` and `PRICECAST__*`
/// environment variables, e.g. `PRICECAST__BUS__URL`.
/// Anything left unset keeps its default value.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("PRICECAST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    builder.build()?.try_deserialize()
}
