//! Locating and loading the MCP server configuration.
//!
//! Precedence for the file to read: `--config` > `KSC_MCP_CONFIG` >
//! `<config dir>/mcp.toml`, where the config dir is `KSC_CONFIG_DIR` or
//! `~/.ksc/`.

use anyhow::{Context, Result, bail};
use ksc_mcp::McpConfig;
use std::path::{Path, PathBuf};

/// File name of the default configuration inside the config dir.
pub const CONFIG_FILE: &str = "mcp.toml";

/// Get the ksc config directory path (~/.ksc/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KSC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ksc")
}

/// Where the configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// Explicitly requested files must exist; the default one may not.
    pub required: bool,
}

/// Pick the configuration file according to precedence.
pub fn resolve(explicit: Option<&Path>, from_env: Option<PathBuf>, dir: &Path) -> ConfigSource {
    match (explicit, from_env) {
        (Some(path), _) => ConfigSource {
            path: path.to_path_buf(),
            required: true,
        },
        (None, Some(path)) => ConfigSource {
            path,
            required: true,
        },
        (None, None) => ConfigSource {
            path: dir.join(CONFIG_FILE),
            required: false,
        },
    }
}

/// Load the configuration for this invocation.
pub fn load(explicit: Option<&Path>) -> Result<McpConfig> {
    let from_env = std::env::var_os("KSC_MCP_CONFIG").map(PathBuf::from);
    let source = resolve(explicit, from_env, &config_dir());
    load_from(&source)
}

/// Read and parse one configuration file.
pub fn load_from(source: &ConfigSource) -> Result<McpConfig> {
    let content = match std::fs::read_to_string(&source.path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !source.required => {
            tracing::debug!("No config at {}, no servers configured", source.path.display());
            return Ok(McpConfig::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", source.path.display()));
        }
    };
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", source.path.display()))
}

/// Narrow the configuration to one server, if one was named.
pub fn select(mut config: McpConfig, server: Option<&str>) -> Result<McpConfig> {
    let Some(name) = server else {
        return Ok(config);
    };
    match config.servers.remove(name) {
        Some(server_config) => {
            config.servers.clear();
            config.servers.insert(name.to_string(), server_config);
            Ok(config)
        }
        None => bail!("No MCP server named '{name}' is configured"),
    }
}
