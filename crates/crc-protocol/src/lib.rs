//! CRC Protocol -- wire types and message codec for the relay chat network.
//!
//! TCP between hosts. Messages are packed back to back with no outer
//! framing: a one-byte type tag, big-endian fixed fields, then
//! length-prefixed UTF-8 strings.

pub mod codec;
pub mod messages;

pub use codec::{decode_all, MessageCodec};
pub use messages::*;

/// Host identifier. Assigned externally, unique across the mesh.
/// `0` is reserved: "me" in hop fields, "whoever receives this" in
/// status destinations.
pub type HostId = u32;

/// Largest variable-length field the decoder will buffer (16 MB).
pub const MAX_FIELD_SIZE: usize = 16 * 1024 * 1024;

/// Message type tags.
pub mod tag {
    pub const SERVER_REGISTRATION: u8 = 0x00;
    pub const STATUS_UPDATE: u8 = 0x01;
    pub const SERVER_QUIT: u8 = 0x02;
    pub const CLIENT_REGISTRATION: u8 = 0x80;
    pub const CLIENT_CHAT: u8 = 0x81;
    pub const CLIENT_QUIT: u8 = 0x82;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unrecognized message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("{field} length {size} exceeds limit {max}")]
    FieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },
    #[error("{field} is {size} bytes, wire format allows at most {max}")]
    FieldTooLong {
        field: &'static str,
        size: usize,
        max: usize,
    },
    #[error("{field} is not valid utf-8")]
    InvalidUtf8 { field: &'static str },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
