//! `tokio_util` codec for mux messages carried in byte-stream frames.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, DEFAULT_MAX_FRAME};
use crate::error::{Result, WireError};
use crate::message::Message;

/// Frames and decodes [`Message`]s on an async byte stream.
#[derive(Debug, Clone)]
pub struct MuxCodec {
    max_frame_size: usize,
}

impl MuxCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for MuxCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MuxCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match decode_frame(src, self.max_frame_size)? {
            Some(frame) => Message::decode(frame).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(WireError::ConnectionClosed),
        }
    }
}

impl Encoder<Message> for MuxCodec {
    type Error = WireError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let encoded = item.to_bytes()?;
        if encoded.len() > self.max_frame_size {
            return Err(WireError::PayloadTooLarge {
                size: encoded.len(),
                max: self.max_frame_size,
            });
        }
        encode_frame(&encoded, dst)
    }
}
