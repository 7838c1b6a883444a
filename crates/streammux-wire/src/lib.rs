//! Binary wire codec for multiplexed streams.
//!
//! Every mux message starts with a fixed 3-byte header:
//! - a priority byte (0 is the shutdown sentinel, 1 is most urgent)
//! - the contextual stream id
//! - the message type
//!
//! followed by big-endian type-specific fields. Messages travel over a
//! message-oriented channel; when that channel is a plain byte stream each
//! message is wrapped in a length-prefixed frame.

pub mod codec;
pub mod codes;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub mod async_codec;

#[cfg(feature = "async")]
pub use async_codec::MuxCodec;
pub use codec::{decode_frame, encode_frame, FrameConfig, DEFAULT_MAX_FRAME, FRAME_HEADER_SIZE};
pub use codes::{
    fail_code_name, MAX_STREAMS_EXCEEDED, NO_LISTENER, PENDING_EXCEEDED, START_FAILURE,
};
pub use error::{Result, WireError};
pub use message::{
    buffer_type, peek_stream_id, Message, MessageType, HEADER_SIZE, MAX_DATA_PAYLOAD,
    MAX_MESSAGE_SIZE, SHUTDOWN_PRIORITY,
};
pub use reader::FrameReader;
pub use writer::FrameWriter;
