use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::message::MAX_MESSAGE_SIZE;

/// Frame header: magic (2) + length (4) = 6 bytes.
pub const FRAME_HEADER_SIZE: usize = 6;

/// Magic bytes: "SM" (0x53 0x4D).
pub const MAGIC: [u8; 2] = [0x53, 0x4D];

/// Default maximum frame payload: one maximal mux message.
pub const DEFAULT_MAX_FRAME: usize = MAX_MESSAGE_SIZE;

/// Encode one mux message into a byte-stream frame.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬─────────────────┐
/// │ Magic (2B)   │ Length    │ Message          │
/// │ 0x53 0x4D    │ (4B BE)   │ (Length bytes)   │
/// │ "SM"         │           │                  │
/// └──────────────┴───────────┴─────────────────┘
/// ```
pub fn encode_frame(message: &[u8], dst: &mut BytesMut) -> Result<()> {
    if message.len() > u32::MAX as usize {
        return Err(WireError::PayloadTooLarge {
            size: message.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(FRAME_HEADER_SIZE + message.len());
    dst.put_slice(&MAGIC);
    dst.put_u32(message.len() as u32);
    dst.put_slice(message);
    Ok(())
}

/// Decode one frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_frame: usize) -> Result<Option<Bytes>> {
    if src.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(WireError::InvalidMagic);
    }

    let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if len > max_frame {
        return Err(WireError::PayloadTooLarge {
            size: len,
            max: max_frame,
        });
    }

    if src.len() < FRAME_HEADER_SIZE + len {
        src.reserve(FRAME_HEADER_SIZE + len - src.len());
        return Ok(None);
    }

    src.advance(FRAME_HEADER_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// Configuration for byte-stream framing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame payload in bytes. Default: one maximal mux message.
    pub max_frame_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn encode_decode_roundtrip() {
        let message = Message::BufferIncrement {
            priority: 3,
            stream_id: 9,
            increment: 512,
        }
        .to_bytes()
        .unwrap();
        let mut buf = BytesMut::new();

        encode_frame(&message, &mut buf).unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + message.len());

        let frame = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(frame, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_header_waits() {
        let mut buf = BytesMut::from(&[0x53, 0x4D, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().is_none());
    }

    #[test]
    fn incomplete_body_waits() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", &mut buf).unwrap();
        buf.truncate(FRAME_HEADER_SIZE + 2);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().is_none());
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0, 0, 0, 0][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME);
        assert!(matches!(result, Err(WireError::InvalidMagic)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(DEFAULT_MAX_FRAME as u32 + 1);
        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME);
        assert!(matches!(result, Err(WireError::PayloadTooLarge { .. })));
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = BytesMut::new();
        encode_frame(b"first", &mut buf).unwrap();
        encode_frame(b"second", &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(f1.as_ref(), b"first");
        assert_eq!(f2.as_ref(), b"second");
        assert!(buf.is_empty());
    }
}
