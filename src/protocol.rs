//! Wire format for the primary/secondary local-socket protocol.
//!
//! Every logical message travels as two frames, each acknowledged by one
//! [`ACK_BYTE`](crate::constants::ACK_BYTE):
//!
//! ```text
//! header frame:  [0..8]  body length N: u64 LE
//! body frame:    [0..N]  body bytes
//! ```
//!
//! The first body on a connection is the handshake below; every later body is
//! an opaque payload.

use crate::checksum::checksum;
use crate::constants::{FRAME_HEADER_SIZE, HANDSHAKE_FIXED_LEN};
use crate::error::{Result, SingleError};

// ─── Connection type ─────────────────────────────────────────────────────────

/// Why a secondary opened the connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    NewInstance = 1,
    SecondaryInstance = 2,
    Reconnect = 3,
}

impl TryFrom<u8> for ConnectionType {
    type Error = SingleError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ConnectionType::NewInstance),
            2 => Ok(ConnectionType::SecondaryInstance),
            3 => Ok(ConnectionType::Reconnect),
            _ => Err(SingleError::Corrupted),
        }
    }
}

// ─── Frame header ────────────────────────────────────────────────────────────

pub fn encode_header(len: u64) -> [u8; FRAME_HEADER_SIZE] {
    len.to_le_bytes()
}

pub fn decode_header(bytes: [u8; FRAME_HEADER_SIZE]) -> u64 {
    u64::from_le_bytes(bytes)
}

// ─── Handshake body ──────────────────────────────────────────────────────────

/// First body frame sent by a secondary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub server_name: String,
    pub connection_type: ConnectionType,
    pub instance_id: u32,
}

/// Encode a handshake body.
///
/// Layout:
/// ```text
/// [0..4]       name_len: u32 LE
/// [4..4+n]     rendezvous name bytes
/// [+0..+1]     connection type: u8
/// [+1..+5]     instance id: u32 LE
/// [+5..+7]     checksum of all preceding bytes: u16 LE
/// ```
pub fn encode_handshake(handshake: &Handshake) -> Vec<u8> {
    let name = handshake.server_name.as_bytes();
    let mut buf = Vec::with_capacity(HANDSHAKE_FIXED_LEN + name.len());

    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(name);
    buf.push(handshake.connection_type as u8);
    buf.extend_from_slice(&handshake.instance_id.to_le_bytes());
    let sum = checksum(&buf);
    buf.extend_from_slice(&sum.to_le_bytes());

    buf
}

/// Decode and validate a handshake body against the local rendezvous name.
///
/// Any mismatch (size, checksum, name, connection type) means the peer is
/// foreign or corrupt and yields `HandshakeRejected`.
pub fn decode_handshake(data: &[u8], expected_name: &str) -> Result<Handshake> {
    if data.len() < HANDSHAKE_FIXED_LEN {
        return Err(SingleError::HandshakeRejected);
    }

    let (signed, tail) = data.split_at(data.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if checksum(signed) != received {
        return Err(SingleError::HandshakeRejected);
    }

    let name_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() != HANDSHAKE_FIXED_LEN + name_len {
        return Err(SingleError::HandshakeRejected);
    }

    let name = &data[4..4 + name_len];
    if name != expected_name.as_bytes() {
        return Err(SingleError::HandshakeRejected);
    }

    let rest = &data[4 + name_len..];
    let connection_type =
        ConnectionType::try_from(rest[0]).map_err(|_| SingleError::HandshakeRejected)?;
    let instance_id = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]);

    Ok(Handshake {
        server_name: expected_name.to_owned(),
        connection_type,
        instance_id,
    })
}
