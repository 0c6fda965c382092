//! Server configuration
//!
//! Settings come from a TOML file, then environment overrides.
//! Priority: environment variables > config file > defaults.
//!
//! ```toml
//! data_dir = "/var/lib/zonesync"
//!
//! [replication]
//! node_name = "ns1"
//! listen_addr = "0.0.0.0:15353"
//! pull_interval_ms = 10000
//!
//! [[replication.peers]]
//! name = "ns2"
//! host = "10.0.0.2"
//! auth_schema = "chap"
//! shared_key = "s3cret"
//!
//! [session]
//! idle_timeout_ms = 20000
//! ```

use anyhow::Context;
use std::path::{Path, PathBuf};
use zonesync_core::NodeConfig;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "ZONESYNC_CONFIG";
/// Environment override for the data directory
pub const DATA_DIR_ENV: &str = "ZONESYNC_DATA_DIR";
/// Environment override for the peer listen address
pub const LISTEN_ENV: &str = "ZONESYNC_LISTEN";
/// Environment override for the node name
pub const NODE_NAME_ENV: &str = "ZONESYNC_NODE_NAME";

/// Parse a TOML config file
pub fn from_file(path: &Path) -> anyhow::Result<NodeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = toml::from_str::<NodeConfig>(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded configuration from {:?}", path);
    Ok(config)
}

/// Apply environment overrides read through `env`
pub fn apply_overrides(config: &mut NodeConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(data_dir) = env(DATA_DIR_ENV) {
        config.data_dir = PathBuf::from(data_dir);
    }
    if let Some(listen) = env(LISTEN_ENV) {
        config.replication.listen_addr = listen;
    }
    if let Some(name) = env(NODE_NAME_ENV) {
        config.replication.node_name = name;
    }
}

/// Load configuration from `path` (or `ZONESYNC_CONFIG`) and the process environment
pub fn load(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    load_with(path, |key| std::env::var(key).ok())
}

/// [`load`] with an explicit environment lookup
pub fn load_with(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<NodeConfig> {
    let path = path.map(Path::to_path_buf).or_else(|| env(CONFIG_ENV).map(PathBuf::from));
    let mut config = match &path {
        Some(path) => from_file(path)?,
        None => {
            tracing::debug!("No config file given, using defaults");
            NodeConfig::default()
        }
    };

    apply_overrides(&mut config, env);
    config.validate().context("invalid configuration")?;
    Ok(config)
}
