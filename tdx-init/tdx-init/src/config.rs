use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tdx_setup::Config;

const DEFAULT_CONFIG_PATH: &str = "/etc/tdx-init/config.toml";
const CONFIG_PATH_ENV: &str = "TDX_INIT_CONFIG";

/// Where to read the configuration from: the CLI argument, then the
/// environment, then the default location.
pub fn resolve_path(arg: Option<&str>) -> PathBuf {
    resolve_path_from(arg, std::env::var(CONFIG_PATH_ENV).ok())
}

fn resolve_path_from(arg: Option<&str>, env: Option<String>) -> PathBuf {
    arg.map(PathBuf::from)
        .or_else(|| env.filter(|path| !path.is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;
    Config::from_toml(&raw).with_context(|| format!("failed to load {}", path.display()))
}
