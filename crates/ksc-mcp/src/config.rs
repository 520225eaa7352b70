//! Server table and client identity, deserialized from TOML.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_client_name() -> String {
    "ksc".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// The `[client]` table and one `[servers.<name>]` table per tool server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub client: ClientIdentity,
    /// Keyed by server name; iteration is in name order.
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

/// How this client introduces itself in `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    #[serde(default = "default_client_name")]
    pub name: String,
    #[serde(default = "default_client_version")]
    pub version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
        }
    }
}

/// How to launch one tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Executable, looked up on `PATH` (e.g. "kubestellar-ops").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Added to the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Deadline for a request that brings none of its own.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl McpServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
