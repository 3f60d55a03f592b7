//! Connection records -- relay state for one live socket.
//!
//! The socket itself lives in the event loop. A record only holds what the
//! relay engine needs: who is on the other end, and the bytes waiting to
//! be parsed or sent.

use std::fmt;

use bytes::BytesMut;
use crc_protocol::HostId;
use serde::{Deserialize, Serialize};

/// Event-loop-local handle for a socket. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Accepted,
    Dialed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Server,
    Client,
}

impl HostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostKind::Server => "server",
            HostKind::Client => "client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub id: HostId,
    pub name: String,
    pub info: String,
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
    /// No registration seen yet.
    #[default]
    Unresolved,
    Server(HostInfo),
    Client(HostInfo),
}

impl Identity {
    pub fn host_id(&self) -> Option<HostId> {
        match self {
            Identity::Unresolved => None,
            Identity::Server(h) | Identity::Client(h) => Some(h.id),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRecord {
    identity: Identity,
    /// Whether our own ServerRegistration has been queued on this socket.
    pub announced: bool,
    /// Bytes read but not yet parsed into a full message.
    pub inbound: BytesMut,
    /// Encoded messages waiting for the socket to become writable.
    pub outbound: BytesMut,
}

impl ConnectionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.identity, Identity::Unresolved)
    }

    /// Resolve the identity. Only the first call has an effect; returns
    /// whether this call resolved the record. Buffers are left alone.
    pub fn resolve(&mut self, identity: Identity) -> bool {
        if self.is_resolved() || matches!(identity, Identity::Unresolved) {
            return false;
        }
        self.identity = identity;
        true
    }

    pub fn peer_id(&self) -> Option<HostId> {
        self.identity.host_id()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }
}
