//! FPort 29 multi-message container
//!
//! Some trackers batch several application messages into one uplink on
//! FPort 29. Each entry is:
//!
//!   Port(1) | Reserved(1) | Len(1) | Message(Len) | Timestamp(4, LE unix seconds)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

pub const CONTAINER_PORT: u8 = 29;

/// Port + reserved + length + timestamp
const ENTRY_OVERHEAD: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMessage {
    pub port: u8,
    pub payload: Vec<u8>,
    pub timestamp: u32,
}

/// Unpack every message from a decrypted FPort 29 payload.
///
/// Trailing bytes too short to hold another entry are ignored.
pub fn unpack_port29_messages(payload: &[u8]) -> Result<Vec<ContainerMessage>, CodecError> {
    let mut buf = payload;
    let mut messages = Vec::new();

    while buf.remaining() >= ENTRY_OVERHEAD {
        let port = buf.get_u8();
        let _reserved = buf.get_u8();
        let len = buf.get_u8() as usize;

        // The message must leave room for its timestamp
        if len + 4 > buf.remaining() {
            return Err(CodecError::TruncatedContainer {
                declared: len,
                remaining: buf.remaining().saturating_sub(4),
            });
        }

        let message = buf[..len].to_vec();
        buf.advance(len);
        let timestamp = buf.get_u32_le();

        messages.push(ContainerMessage {
            port,
            payload: message,
            timestamp,
        });
    }

    Ok(messages)
}

/// Inverse of [`unpack_port29_messages`]
pub fn pack_port29_messages(messages: &[ContainerMessage]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for message in messages {
        buf.put_u8(message.port);
        buf.put_u8(0x00);
        buf.put_u8(message.payload.len() as u8);
        buf.put_slice(&message.payload);
        buf.put_u32_le(message.timestamp);
    }
    buf.to_vec()
}
