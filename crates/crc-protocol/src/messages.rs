//! Wire message types.
//!
//! One enum variant per message kind. Handlers match on `Message`
//! exhaustively, so a new kind is a compile error until every handler
//! deals with it.

use std::fmt;

use crate::{tag, HostId};

// ============================================================================
// Status codes
// ============================================================================

/// Status update code. Kept as a raw `u16` so codes this node does not know
/// about still pass through relays untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const WELCOME: StatusCode = StatusCode(0x00);
    pub const UNKNOWN_ID: StatusCode = StatusCode(0x01);
    pub const DUPLICATE_ID: StatusCode = StatusCode(0x02);
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StatusCode::WELCOME => f.write_str("welcome"),
            StatusCode::UNKNOWN_ID => f.write_str("unknown-id"),
            StatusCode::DUPLICATE_ID => f.write_str("duplicate-id"),
            StatusCode(other) => write!(f, "{other:#06x}"),
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Server or client registration. Same layout for both; the tag decides
/// which kind of host is being announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub source_id: HostId,
    /// `0` on the first send, otherwise the server that relayed it last.
    pub last_hop_id: HostId,
    pub name: String,
    pub info: String,
}

impl Registration {
    pub fn new(
        source_id: HostId,
        last_hop_id: HostId,
        name: impl Into<String>,
        info: impl Into<String>,
    ) -> Self {
        Self {
            source_id,
            last_hop_id,
            name: name.into(),
            info: info.into(),
        }
    }

    /// Copy of this registration as re-sent by `hop`.
    pub fn relayed_by(&self, hop: HostId) -> Self {
        Self {
            last_hop_id: hop,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub source_id: HostId,
    /// `0` means "whoever receives this".
    pub destination_id: HostId,
    pub code: StatusCode,
    pub content: String,
}

impl StatusUpdate {
    pub fn new(
        source_id: HostId,
        destination_id: HostId,
        code: StatusCode,
        content: impl Into<String>,
    ) -> Self {
        Self {
            source_id,
            destination_id,
            code,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientChat {
    pub source_id: HostId,
    pub destination_id: HostId,
    pub content: String,
}

impl ClientChat {
    pub fn new(source_id: HostId, destination_id: HostId, content: impl Into<String>) -> Self {
        Self {
            source_id,
            destination_id,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientQuit {
    pub source_id: HostId,
    pub content: String,
}

impl ClientQuit {
    pub fn new(source_id: HostId, content: impl Into<String>) -> Self {
        Self {
            source_id,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerQuit {
    pub source_id: HostId,
    /// Server taking over the quitting server's links, `0` if none.
    pub replacement_id: HostId,
    pub content: String,
}

impl ServerQuit {
    pub fn new(source_id: HostId, replacement_id: HostId, content: impl Into<String>) -> Self {
        Self {
            source_id,
            replacement_id,
            content: content.into(),
        }
    }
}

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ServerRegistration(Registration),
    ClientRegistration(Registration),
    StatusUpdate(StatusUpdate),
    ServerQuit(ServerQuit),
    ClientChat(ClientChat),
    ClientQuit(ClientQuit),
}

/// Fixed header sizes, tag byte included.
pub(crate) const REGISTRATION_HEADER: usize = 12;
pub(crate) const STATUS_HEADER: usize = 15;
pub(crate) const SERVER_QUIT_HEADER: usize = 13;
pub(crate) const CHAT_HEADER: usize = 13;
pub(crate) const CLIENT_QUIT_HEADER: usize = 9;

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::ServerRegistration(_) => tag::SERVER_REGISTRATION,
            Message::ClientRegistration(_) => tag::CLIENT_REGISTRATION,
            Message::StatusUpdate(_) => tag::STATUS_UPDATE,
            Message::ServerQuit(_) => tag::SERVER_QUIT,
            Message::ClientChat(_) => tag::CLIENT_CHAT,
            Message::ClientQuit(_) => tag::CLIENT_QUIT,
        }
    }

    pub fn source_id(&self) -> HostId {
        match self {
            Message::ServerRegistration(m) | Message::ClientRegistration(m) => m.source_id,
            Message::StatusUpdate(m) => m.source_id,
            Message::ServerQuit(m) => m.source_id,
            Message::ClientChat(m) => m.source_id,
            Message::ClientQuit(m) => m.source_id,
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ServerRegistration(_) => "server-registration",
            Message::ClientRegistration(_) => "client-registration",
            Message::StatusUpdate(_) => "status-update",
            Message::ServerQuit(_) => "server-quit",
            Message::ClientChat(_) => "client-chat",
            Message::ClientQuit(_) => "client-quit",
        }
    }

    /// Number of bytes this message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::ServerRegistration(m) | Message::ClientRegistration(m) => {
                REGISTRATION_HEADER + m.name.len() + m.info.len()
            }
            Message::StatusUpdate(m) => STATUS_HEADER + m.content.len(),
            Message::ServerQuit(m) => SERVER_QUIT_HEADER + m.content.len(),
            Message::ClientChat(m) => CHAT_HEADER + m.content.len(),
            Message::ClientQuit(m) => CLIENT_QUIT_HEADER + m.content.len(),
        }
    }
}
