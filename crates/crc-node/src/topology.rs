//! Topology table -- every host this node knows about, and how to reach it.
//!
//! Maps HostId → HostRecord. Adjacent hosts carry the connection they are
//! attached to; everything else is reached through `first_link_id`, the
//! adjacent server it was learned from. The adjacency sets are derived from
//! the map and only change inside `insert`/`remove`.

use std::collections::{BTreeSet, HashMap};

use crc_protocol::HostId;

use crate::connection::{ConnId, HostKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub id: HostId,
    pub kind: HostKind,
    pub name: String,
    pub info: String,
    /// `0` for adjacent hosts, otherwise the neighbor it was learned through.
    pub first_link_id: HostId,
    /// Set only for adjacent hosts.
    pub conn: Option<ConnId>,
}

impl HostRecord {
    pub fn adjacent(
        id: HostId,
        kind: HostKind,
        name: impl Into<String>,
        info: impl Into<String>,
        conn: ConnId,
    ) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            info: info.into(),
            first_link_id: 0,
            conn: Some(conn),
        }
    }

    pub fn remote(
        id: HostId,
        kind: HostKind,
        name: impl Into<String>,
        info: impl Into<String>,
        first_link_id: HostId,
    ) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            info: info.into(),
            first_link_id,
            conn: None,
        }
    }

    pub fn is_adjacent(&self) -> bool {
        self.conn.is_some()
    }
}

#[derive(Debug, Default)]
pub struct Topology {
    hosts: HashMap<HostId, HostRecord>,
    adjacent_servers: BTreeSet<HostId>,
    adjacent_clients: BTreeSet<HostId>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: HostId) -> bool {
        self.hosts.contains_key(&id)
    }

    pub fn get(&self, id: HostId) -> Option<&HostRecord> {
        self.hosts.get(&id)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Insert a host. An already-known ID is refused and the record handed
    /// back; the table is left untouched.
    pub fn insert(&mut self, record: HostRecord) -> Result<(), HostRecord> {
        if self.hosts.contains_key(&record.id) {
            return Err(record);
        }
        if record.is_adjacent() {
            match record.kind {
                HostKind::Server => self.adjacent_servers.insert(record.id),
                HostKind::Client => self.adjacent_clients.insert(record.id),
            };
        }
        tracing::debug!(
            id = record.id,
            kind = record.kind.as_str(),
            adjacent = record.is_adjacent(),
            first_link = record.first_link_id,
            "topology: host added"
        );
        self.hosts.insert(record.id, record);
        Ok(())
    }

    pub fn remove(&mut self, id: HostId) -> Option<HostRecord> {
        let removed = self.hosts.remove(&id)?;
        self.adjacent_servers.remove(&id);
        self.adjacent_clients.remove(&id);
        tracing::debug!(
            id,
            kind = removed.kind.as_str(),
            remaining = self.hosts.len(),
            "topology: host removed"
        );
        Some(removed)
    }

    /// Connection that leads toward `id`: its own socket when adjacent,
    /// otherwise the socket of the neighbor it was learned through.
    pub fn route(&self, id: HostId) -> Option<ConnId> {
        let record = self.hosts.get(&id)?;
        match record.conn {
            Some(conn) => Some(conn),
            None => self.hosts.get(&record.first_link_id)?.conn,
        }
    }

    pub fn adjacent_servers(&self) -> &BTreeSet<HostId> {
        &self.adjacent_servers
    }

    pub fn adjacent_clients(&self) -> &BTreeSet<HostId> {
        &self.adjacent_clients
    }

    /// All hosts ordered by ID.
    pub fn sorted(&self) -> Vec<&HostRecord> {
        let mut hosts: Vec<&HostRecord> = self.hosts.values().collect();
        hosts.sort_by_key(|h| h.id);
        hosts
    }

    /// Hosts learned through `link`, ordered by ID.
    pub fn learned_via(&self, link: HostId) -> Vec<HostId> {
        let mut ids: Vec<HostId> = self
            .hosts
            .values()
            .filter(|h| !h.is_adjacent() && h.first_link_id == link)
            .map(|h| h.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
