use anyhow::{anyhow, Context, Result};
use ::config::{Config, Environment, File, FileFormat};
use std::path::Path;
use tracing::{debug, info};

use super::gateway::GatewayConfig;

pub const ENV_PREFIX: &str = "PROMOTE";

/// Layer defaults, the optional TOML file and `PROMOTE__*` variables, then
/// the per-kind reload URL overrides. The result is validated.
pub fn load(path: &Path) -> Result<GatewayConfig> {
    load_with(path, Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true), |name| {
        std::env::var(name).ok()
    })
}

pub(crate) fn load_with<F>(path: &Path, env: Environment, lookup: F) -> Result<GatewayConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if path.exists() {
        info!("Loading configuration from {}", path.display());
    } else {
        debug!("No configuration file at {}, using defaults", path.display());
    }

    let defaults = Config::try_from(&GatewayConfig::default()).context("Failed to serialize defaults")?;
    let layered = Config::builder()
        .add_source(defaults)
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(env)
        .build()
        .with_context(|| format!("Failed to read configuration {}", path.display()))?;

    let mut config: GatewayConfig = layered
        .try_deserialize()
        .context("Invalid configuration")?;
    config.apply_reload_overrides(lookup);

    config
        .validate()
        .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join(", ")))?;
    Ok(config)
}
