//! Configuration loading

use anyhow::Context;
use config::{Config, Environment, File};
use std::path::Path;
use tusk_core::EngineConfig;

/// Environment variable prefix, e.g. `TUSK_ASYNC_UPLOADS`
pub const ENV_PREFIX: &str = "TUSK";

/// Load the engine configuration.
///
/// Sources, later ones winning: built-in defaults, the optional TOML file,
/// `TUSK_*` environment variables (`__` separates nested keys, as in
/// `TUSK_TOKENS__TRANSFER_SHARED_SECRET`).
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder
        .build()
        .context("failed to read configuration")?
        .try_deserialize()
        .context("invalid configuration")
}
