//! Binary codec for CRC messages.
//!
//! Wire format: tag byte, big-endian fixed fields, then length-prefixed
//! UTF-8 strings. There is no outer length prefix, so the decoder works out
//! each message's size from its tag and fixed header before taking it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::*;
use crate::{tag, ProtocolError, MAX_FIELD_SIZE};

/// Codec for framing Message values over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

/// Decode every complete message in `src`, in order. A partial trailing
/// message stays in `src` for the next read.
pub fn decode_all(src: &mut BytesMut) -> Result<Vec<Message>, ProtocolError> {
    let mut codec = MessageCodec;
    let mut messages = Vec::new();
    while let Some(message) = codec.decode(src)? {
        messages.push(message);
    }
    Ok(messages)
}

fn header_len(tag: u8) -> Result<usize, ProtocolError> {
    match tag {
        tag::SERVER_REGISTRATION | tag::CLIENT_REGISTRATION => Ok(REGISTRATION_HEADER),
        tag::STATUS_UPDATE => Ok(STATUS_HEADER),
        tag::SERVER_QUIT => Ok(SERVER_QUIT_HEADER),
        tag::CLIENT_CHAT => Ok(CHAT_HEADER),
        tag::CLIENT_QUIT => Ok(CLIENT_QUIT_HEADER),
        other => Err(ProtocolError::UnknownTag(other)),
    }
}

fn be_u32(bytes: &[u8]) -> usize {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

fn checked_content(size: usize) -> Result<usize, ProtocolError> {
    if size > MAX_FIELD_SIZE {
        return Err(ProtocolError::FieldTooLarge {
            field: "content",
            size,
            max: MAX_FIELD_SIZE,
        });
    }
    Ok(size)
}

/// Length of the variable part, read from a complete fixed header.
fn body_len(header: &[u8]) -> Result<usize, ProtocolError> {
    match header[0] {
        tag::SERVER_REGISTRATION | tag::CLIENT_REGISTRATION => {
            let name_len = header[9] as usize;
            let info_len = u16::from_be_bytes([header[10], header[11]]) as usize;
            Ok(name_len + info_len)
        }
        tag::STATUS_UPDATE => checked_content(be_u32(&header[11..15])),
        tag::SERVER_QUIT | tag::CLIENT_CHAT => checked_content(be_u32(&header[9..13])),
        tag::CLIENT_QUIT => checked_content(be_u32(&header[5..9])),
        other => Err(ProtocolError::UnknownTag(other)),
    }
}

fn take_string(
    frame: &mut BytesMut,
    len: usize,
    field: &'static str,
) -> Result<String, ProtocolError> {
    let bytes = frame.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
}

fn take_registration(frame: &mut BytesMut) -> Result<Registration, ProtocolError> {
    let source_id = frame.get_u32();
    let last_hop_id = frame.get_u32();
    let name_len = frame.get_u8() as usize;
    let info_len = frame.get_u16() as usize;
    let name = take_string(frame, name_len, "name")?;
    let info = take_string(frame, info_len, "info")?;
    Ok(Registration {
        source_id,
        last_hop_id,
        name,
        info,
    })
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&tag) = src.first() else {
            return Ok(None);
        };

        // Unknown tags fail here, before we wait on bytes that may never come
        let header = header_len(tag)?;
        if src.len() < header {
            return Ok(None);
        }

        let total = header + body_len(&src[..header])?;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(1);

        let message = match tag {
            tag::SERVER_REGISTRATION => Message::ServerRegistration(take_registration(&mut frame)?),
            tag::CLIENT_REGISTRATION => Message::ClientRegistration(take_registration(&mut frame)?),
            tag::STATUS_UPDATE => {
                let source_id = frame.get_u32();
                let destination_id = frame.get_u32();
                let code = StatusCode(frame.get_u16());
                let len = frame.get_u32() as usize;
                Message::StatusUpdate(StatusUpdate {
                    source_id,
                    destination_id,
                    code,
                    content: take_string(&mut frame, len, "content")?,
                })
            }
            tag::SERVER_QUIT => {
                let source_id = frame.get_u32();
                let replacement_id = frame.get_u32();
                let len = frame.get_u32() as usize;
                Message::ServerQuit(ServerQuit {
                    source_id,
                    replacement_id,
                    content: take_string(&mut frame, len, "content")?,
                })
            }
            tag::CLIENT_CHAT => {
                let source_id = frame.get_u32();
                let destination_id = frame.get_u32();
                let len = frame.get_u32() as usize;
                Message::ClientChat(ClientChat {
                    source_id,
                    destination_id,
                    content: take_string(&mut frame, len, "content")?,
                })
            }
            tag::CLIENT_QUIT => {
                let source_id = frame.get_u32();
                let len = frame.get_u32() as usize;
                Message::ClientQuit(ClientQuit {
                    source_id,
                    content: take_string(&mut frame, len, "content")?,
                })
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        };

        tracing::trace!(kind = message.kind(), len = total, "codec: decoded");
        Ok(Some(message))
    }
}

fn check_len(field: &'static str, size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::FieldTooLong { field, size, max });
    }
    Ok(())
}

fn put_registration(reg: &Registration, dst: &mut BytesMut) {
    dst.put_u32(reg.source_id);
    dst.put_u32(reg.last_hop_id);
    dst.put_u8(reg.name.len() as u8);
    dst.put_u16(reg.info.len() as u16);
    dst.extend_from_slice(reg.name.as_bytes());
    dst.extend_from_slice(reg.info.as_bytes());
}

impl Encoder<&Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Validate everything before touching dst so a failed encode
        // leaves no half-written message behind
        match item {
            Message::ServerRegistration(reg) | Message::ClientRegistration(reg) => {
                check_len("name", reg.name.len(), u8::MAX as usize)?;
                check_len("info", reg.info.len(), u16::MAX as usize)?;
            }
            Message::StatusUpdate(StatusUpdate { content, .. })
            | Message::ServerQuit(ServerQuit { content, .. })
            | Message::ClientChat(ClientChat { content, .. })
            | Message::ClientQuit(ClientQuit { content, .. }) => {
                check_len("content", content.len(), MAX_FIELD_SIZE)?;
            }
        }

        dst.reserve(item.encoded_len());
        dst.put_u8(item.tag());
        match item {
            Message::ServerRegistration(reg) | Message::ClientRegistration(reg) => {
                put_registration(reg, dst);
            }
            Message::StatusUpdate(m) => {
                dst.put_u32(m.source_id);
                dst.put_u32(m.destination_id);
                dst.put_u16(m.code.0);
                dst.put_u32(m.content.len() as u32);
                dst.extend_from_slice(m.content.as_bytes());
            }
            Message::ServerQuit(m) => {
                dst.put_u32(m.source_id);
                dst.put_u32(m.replacement_id);
                dst.put_u32(m.content.len() as u32);
                dst.extend_from_slice(m.content.as_bytes());
            }
            Message::ClientChat(m) => {
                dst.put_u32(m.source_id);
                dst.put_u32(m.destination_id);
                dst.put_u32(m.content.len() as u32);
                dst.extend_from_slice(m.content.as_bytes());
            }
            Message::ClientQuit(m) => {
                dst.put_u32(m.source_id);
                dst.put_u32(m.content.len() as u32);
                dst.extend_from_slice(m.content.as_bytes());
            }
        }

        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(&item, dst)
    }
}
