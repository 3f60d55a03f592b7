//! Point-in-time view of a node's relay state.
//!
//! Published by the event loop after every iteration that changed something,
//! and written to disk on exit when a snapshot path is configured.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use crc_protocol::HostId;
use serde::{Deserialize, Serialize};

use crate::connection::HostKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSummary {
    pub kind: HostKind,
    pub name: String,
    pub info: String,
    /// `0` when adjacent.
    pub first_link_id: HostId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: HostId,
    pub name: String,
    pub hosts: BTreeMap<HostId, HostSummary>,
    pub adjacent_servers: Vec<HostId>,
    pub adjacent_clients: Vec<HostId>,
    pub status_log: Vec<String>,
    pub chat_log: Vec<String>,
    /// Live sockets, registered or not, excluding the listener.
    pub connections: usize,
}

impl NodeSnapshot {
    pub fn knows(&self, id: HostId) -> bool {
        self.hosts.contains_key(&id)
    }

    pub fn first_link(&self, id: HostId) -> Option<HostId> {
        self.hosts.get(&id).map(|h| h.first_link_id)
    }

    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing snapshot")?;
        std::fs::write(path, json)
            .with_context(|| format!("writing snapshot to {}", path.display()))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading snapshot from {}", path.display()))?;
        serde_json::from_str(&raw).context("parsing snapshot")
    }
}
