/// Errors that can occur while encoding, decoding or framing mux messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The message is shorter than its fixed layout requires.
    #[error("truncated {kind} message ({len} bytes, need {need})")]
    Truncated {
        kind: &'static str,
        len: usize,
        need: usize,
    },

    /// Byte 2 does not name a known message type.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// A DATA payload does not fit the 16-bit length field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x534D \"SM\")")]
    InvalidMagic,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WireError>;
