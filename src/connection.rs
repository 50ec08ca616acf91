//! Per-connection protocol driver on the primary side.
//!
//! The state machine is socket-agnostic: the reactor feeds it whatever bytes
//! became readable and executes the returned [`Action`]s in order.
//!
//! ```text
//! InitHeader ─8 bytes─▶ InitBody ─valid handshake─▶ ConnectedHeader
//!                           │                          ▲       │
//!                      bad handshake                   │    8 bytes
//!                           ▼                          │       ▼
//!                         Close            payload ◀── ConnectedBody
//! ```

use crate::constants::{FRAME_HEADER_SIZE, MAX_FRAME_LEN, MAX_HANDSHAKE_LEN};
use crate::protocol::{decode_handshake, decode_header, ConnectionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the length header of the handshake.
    InitHeader,
    /// Waiting for the handshake body.
    InitBody,
    /// Handshake done; waiting for a payload header.
    ConnectedHeader,
    /// Waiting for a payload body.
    ConnectedBody,
}

impl Stage {
    pub fn is_connected(self) -> bool {
        matches!(self, Stage::ConnectedHeader | Stage::ConnectedBody)
    }
}

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write one [`ACK_BYTE`](crate::constants::ACK_BYTE) back to the peer.
    Ack,
    /// Raise "instance started" to the owner.
    InstanceStarted,
    /// Deliver a payload tagged with the sender's instance id.
    Message { instance_id: u32, payload: Vec<u8> },
    /// Drop the connection without acknowledging.
    Close,
}

/// What the primary checks an incoming handshake against.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub server_name: String,
    pub secondary_notification: bool,
}

#[derive(Debug)]
pub struct ConnectionState {
    stage: Stage,
    pending_len: u64,
    instance_id: u32,
    buffer: Vec<u8>,
    closed: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            stage: Stage::InitHeader,
            pending_len: 0,
            instance_id: 0,
            buffer: Vec::new(),
            closed: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn pending_len(&self) -> u64 {
        self.pending_len
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append freshly read bytes and advance as far as complete frames allow.
    pub fn feed(&mut self, data: &[u8], ctx: &ServerContext, actions: &mut Vec<Action>) {
        if self.closed {
            return;
        }
        self.buffer.extend_from_slice(data);
        self.advance(ctx, actions);
    }

    /// Peer closed: one last pass over whatever is still buffered.
    ///
    /// Returns the number of bytes that never formed a complete frame.
    pub fn finish(&mut self, ctx: &ServerContext, actions: &mut Vec<Action>) -> usize {
        if !self.closed {
            self.advance(ctx, actions);
            self.closed = true;
        }
        std::mem::take(&mut self.buffer).len()
    }

    fn advance(&mut self, ctx: &ServerContext, actions: &mut Vec<Action>) {
        while !self.closed {
            match self.stage {
                Stage::InitHeader | Stage::ConnectedHeader => {
                    let Some(len) = self.take_header() else {
                        return;
                    };
                    let limit = if self.stage == Stage::InitHeader {
                        MAX_HANDSHAKE_LEN
                    } else {
                        MAX_FRAME_LEN
                    };
                    if len > limit {
                        tracing::debug!(len, limit, "frame length over limit, closing");
                        self.reject(actions);
                        return;
                    }
                    self.pending_len = len;
                    self.stage = if self.stage == Stage::InitHeader {
                        Stage::InitBody
                    } else {
                        Stage::ConnectedBody
                    };
                    actions.push(Action::Ack);
                }
                Stage::InitBody => {
                    let Some(body) = self.take_body() else {
                        return;
                    };
                    let handshake = match decode_handshake(&body, &ctx.server_name) {
                        Ok(handshake) => handshake,
                        Err(err) => {
                            tracing::debug!(%err, "handshake rejected");
                            self.reject(actions);
                            return;
                        }
                    };
                    self.instance_id = handshake.instance_id;
                    self.stage = Stage::ConnectedHeader;

                    let notify = match handshake.connection_type {
                        ConnectionType::NewInstance => true,
                        ConnectionType::SecondaryInstance => ctx.secondary_notification,
                        ConnectionType::Reconnect => false,
                    };
                    if notify {
                        actions.push(Action::InstanceStarted);
                    }
                    actions.push(Action::Ack);
                }
                Stage::ConnectedBody => {
                    let Some(payload) = self.take_body() else {
                        return;
                    };
                    actions.push(Action::Message {
                        instance_id: self.instance_id,
                        payload,
                    });
                    actions.push(Action::Ack);
                    self.stage = Stage::ConnectedHeader;
                }
            }
        }
    }

    fn take_header(&mut self) -> Option<u64> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_SIZE]);
        self.buffer.drain(..FRAME_HEADER_SIZE);
        Some(decode_header(header))
    }

    fn take_body(&mut self) -> Option<Vec<u8>> {
        let len = self.pending_len as usize;
        if self.buffer.len() < len {
            return None;
        }
        let rest = self.buffer.split_off(len);
        let body = std::mem::replace(&mut self.buffer, rest);
        self.pending_len = 0;
        Some(body)
    }

    fn reject(&mut self, actions: &mut Vec<Action>) {
        self.closed = true;
        self.buffer.clear();
        actions.push(Action::Close);
    }
}
