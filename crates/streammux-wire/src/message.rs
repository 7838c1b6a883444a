use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Priority reserved for the shutdown sentinel. User priorities are 1..=255.
pub const SHUTDOWN_PRIORITY: u8 = 0;

/// Fixed header: priority (1) + stream id (1) + type (1) = 3 bytes.
pub const HEADER_SIZE: usize = 3;

/// Largest DATA payload the 16-bit length field can carry.
pub const MAX_DATA_PAYLOAD: usize = u16::MAX as usize;

/// Largest encoded message: header + DATA length + payload.
pub const MAX_MESSAGE_SIZE: usize = HEADER_SIZE + 2 + MAX_DATA_PAYLOAD;

/// The kind of a mux message, as classified from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Teardown sentinel (priority byte 0).
    Shutdown = 0,
    ConnectRequest = 1,
    ConnectConfirm = 2,
    ConnectFail = 3,
    DisconnectRequest = 4,
    DisconnectConfirm = 5,
    Data = 6,
    BufferIncrement = 7,
}

impl MessageType {
    /// Map a wire type byte to a message type.
    ///
    /// Type byte 0 is never valid: the sentinel is recognised by its
    /// priority byte alone.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::ConnectRequest),
            2 => Ok(Self::ConnectConfirm),
            3 => Ok(Self::ConnectFail),
            4 => Ok(Self::DisconnectRequest),
            5 => Ok(Self::DisconnectConfirm),
            6 => Ok(Self::Data),
            7 => Ok(Self::BufferIncrement),
            other => Err(WireError::UnknownType(other)),
        }
    }

    /// Human-readable name, as used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Shutdown => "SHUTDOWN",
            Self::ConnectRequest => "CONNECT_REQUEST",
            Self::ConnectConfirm => "CONNECT_CONFIRM",
            Self::ConnectFail => "CONNECT_FAIL",
            Self::DisconnectRequest => "DISCONNECT_REQUEST",
            Self::DisconnectConfirm => "DISCONNECT_CONFIRM",
            Self::Data => "DATA",
            Self::BufferIncrement => "BUFFER_INCREMENT",
        }
    }

    /// Bytes a message of this type occupies before any DATA payload.
    fn fixed_len(self) -> usize {
        match self {
            Self::Shutdown | Self::DisconnectRequest | Self::DisconnectConfirm => HEADER_SIZE,
            Self::ConnectConfirm => HEADER_SIZE + 1,
            Self::ConnectRequest | Self::ConnectFail | Self::Data | Self::BufferIncrement => {
                HEADER_SIZE + 2
            }
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classify an encoded message without decoding it.
///
/// A priority byte of 0 marks the teardown sentinel whatever the type byte
/// says, so the dispatcher can stop before looking any further.
pub fn buffer_type(src: &[u8]) -> Result<MessageType> {
    match src.first() {
        None => Err(WireError::Truncated {
            kind: "message",
            len: 0,
            need: 1,
        }),
        Some(&SHUTDOWN_PRIORITY) => Ok(MessageType::Shutdown),
        Some(_) if src.len() < HEADER_SIZE => Err(WireError::Truncated {
            kind: "message",
            len: src.len(),
            need: HEADER_SIZE,
        }),
        Some(_) => MessageType::from_u8(src[2]),
    }
}

/// Read the contextual stream id (byte 1) of an encoded message.
pub fn peek_stream_id(src: &[u8]) -> Option<u8> {
    src.get(1).copied()
}

/// One mux control or data message.
///
/// `stream_id` is always the receiver's id, except for `ConnectRequest`
/// where it is the sender's own id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConnectRequest {
        priority: u8,
        stream_id: u8,
        port: u16,
    },
    ConnectConfirm {
        priority: u8,
        stream_id: u8,
        assigned_id: u8,
    },
    ConnectFail {
        priority: u8,
        stream_id: u8,
        code: u16,
    },
    DisconnectRequest {
        priority: u8,
        stream_id: u8,
    },
    DisconnectConfirm {
        priority: u8,
        stream_id: u8,
    },
    Data {
        priority: u8,
        stream_id: u8,
        payload: Bytes,
    },
    BufferIncrement {
        priority: u8,
        stream_id: u8,
        increment: u16,
    },
    Shutdown,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectRequest { .. } => MessageType::ConnectRequest,
            Self::ConnectConfirm { .. } => MessageType::ConnectConfirm,
            Self::ConnectFail { .. } => MessageType::ConnectFail,
            Self::DisconnectRequest { .. } => MessageType::DisconnectRequest,
            Self::DisconnectConfirm { .. } => MessageType::DisconnectConfirm,
            Self::Data { .. } => MessageType::Data,
            Self::BufferIncrement { .. } => MessageType::BufferIncrement,
            Self::Shutdown => MessageType::Shutdown,
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Self::ConnectRequest { priority, .. }
            | Self::ConnectConfirm { priority, .. }
            | Self::ConnectFail { priority, .. }
            | Self::DisconnectRequest { priority, .. }
            | Self::DisconnectConfirm { priority, .. }
            | Self::Data { priority, .. }
            | Self::BufferIncrement { priority, .. } => *priority,
            Self::Shutdown => SHUTDOWN_PRIORITY,
        }
    }

    pub fn stream_id(&self) -> u8 {
        match self {
            Self::ConnectRequest { stream_id, .. }
            | Self::ConnectConfirm { stream_id, .. }
            | Self::ConnectFail { stream_id, .. }
            | Self::DisconnectRequest { stream_id, .. }
            | Self::DisconnectConfirm { stream_id, .. }
            | Self::Data { stream_id, .. }
            | Self::BufferIncrement { stream_id, .. } => *stream_id,
            Self::Shutdown => 0,
        }
    }

    /// The total wire size of this message.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Data { payload, .. } => self.message_type().fixed_len() + payload.len(),
            _ => self.message_type().fixed_len(),
        }
    }

    /// Encode this message into `dst`.
    ///
    /// Wire format (big-endian):
    /// ```text
    /// ┌──────────┬───────────┬────────┬──────────────────────────┐
    /// │ Priority │ Stream id │ Type   │ Type-specific fields     │
    /// │ (1B)     │ (1B)      │ (1B)   │                          │
    /// └──────────┴───────────┴────────┴──────────────────────────┘
    /// ```
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if let Self::Data { payload, .. } = self {
            if payload.len() > MAX_DATA_PAYLOAD {
                return Err(WireError::PayloadTooLarge {
                    size: payload.len(),
                    max: MAX_DATA_PAYLOAD,
                });
            }
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(self.priority());
        dst.put_u8(self.stream_id());
        dst.put_u8(self.message_type() as u8);

        match self {
            Self::ConnectRequest { port, .. } => dst.put_u16(*port),
            Self::ConnectConfirm { assigned_id, .. } => dst.put_u8(*assigned_id),
            Self::ConnectFail { code, .. } => dst.put_u16(*code),
            Self::Data { payload, .. } => {
                dst.put_u16(payload.len() as u16);
                dst.put_slice(payload);
            }
            Self::BufferIncrement { increment, .. } => dst.put_u16(*increment),
            Self::DisconnectRequest { .. } | Self::DisconnectConfirm { .. } | Self::Shutdown => {}
        }
        Ok(())
    }

    /// Encode this message into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode one message.
    ///
    /// A DATA payload is returned as a slice of `src` without copying. Only
    /// a priority-0 message with no valid type decodes as [`Message::Shutdown`].
    pub fn decode(mut src: Bytes) -> Result<Self> {
        if src.first() == Some(&SHUTDOWN_PRIORITY)
            && (src.len() < HEADER_SIZE || src[2] == MessageType::Shutdown as u8)
        {
            return Ok(Self::Shutdown);
        }
        if src.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                kind: "message",
                len: src.len(),
                need: HEADER_SIZE,
            });
        }

        let kind = MessageType::from_u8(src[2])?;
        let need = kind.fixed_len();
        if src.len() < need {
            return Err(WireError::Truncated {
                kind: kind.name(),
                len: src.len(),
                need,
            });
        }

        let priority = src.get_u8();
        let stream_id = src.get_u8();
        src.advance(1);

        let message = match kind {
            MessageType::Shutdown => return Err(WireError::UnknownType(0)),
            MessageType::ConnectRequest => Self::ConnectRequest {
                priority,
                stream_id,
                port: src.get_u16(),
            },
            MessageType::ConnectConfirm => Self::ConnectConfirm {
                priority,
                stream_id,
                assigned_id: src.get_u8(),
            },
            MessageType::ConnectFail => Self::ConnectFail {
                priority,
                stream_id,
                code: src.get_u16(),
            },
            MessageType::DisconnectRequest => Self::DisconnectRequest {
                priority,
                stream_id,
            },
            MessageType::DisconnectConfirm => Self::DisconnectConfirm {
                priority,
                stream_id,
            },
            MessageType::Data => {
                let len = src.get_u16() as usize;
                if src.remaining() < len {
                    return Err(WireError::Truncated {
                        kind: kind.name(),
                        len: need + src.remaining(),
                        need: need + len,
                    });
                }
                Self::Data {
                    priority,
                    stream_id,
                    payload: src.split_to(len),
                }
            }
            MessageType::BufferIncrement => Self::BufferIncrement {
                priority,
                stream_id,
                increment: src.get_u16(),
            },
        };
        Ok(message)
    }
}
