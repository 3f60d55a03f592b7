//! Configuration types for crc-node.
//! Parsed from a TOML file, then overridden by command-line flags.

use anyhow::{bail, Context};
use crc_protocol::HostId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Host ID of this server. Must be non-zero and unique on the mesh.
    #[serde(default)]
    pub id: HostId,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub info: String,
    /// Where to write the final snapshot as JSON on exit.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: 0,
            name: default_name(),
            info: String::new(),
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Bootstrap server to dial at startup, `host:port`.
    pub connect_to: Option<String>,
    /// Bootstrap server's name. Only used in log output.
    pub connect_to_name: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_to: None,
            connect_to_name: None,
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "crc-server".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0:9000".into()
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_connect_timeout_ms() -> u64 {
    5000
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: NodeConfig = toml::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.id == 0 {
            bail!("node id must be non-zero (0 is reserved)");
        }
        if self.node.name.is_empty() {
            bail!("node name must not be empty");
        }
        if self.node.name.len() > u8::MAX as usize {
            bail!("node name is longer than 255 bytes");
        }
        if self.network.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        Ok(())
    }

    /// Set the listen port, keeping the configured interface.
    pub fn set_listen_port(&mut self, port: u16) {
        let host = self
            .network
            .listen_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".into());
        self.network.listen_addr = format!("{host}:{port}");
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen_addr {:?}", self.network.listen_addr))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.network.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connect_timeout_ms)
    }
}
