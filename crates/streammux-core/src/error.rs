use std::io;
use std::time::Duration;

use streammux_wire::fail_code_name;

/// Errors that can occur in multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Wire-level encode/decode or framing error.
    #[error("wire error: {0}")]
    Wire(#[from] streammux_wire::WireError),

    /// A bounded resource (stream ids, stream ports) is used up.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An argument was out of range or referred to something not in use.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A message arrived that the stream's current state does not allow.
    #[error("protocol sequence error: {0}")]
    ProtocolSequence(String),

    /// The peer sent more DATA than the advertised window allowed.
    #[error("flow control violation: {received} bytes with {free} free")]
    FlowControl { received: usize, free: usize },

    /// A connect or close deadline passed.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The peer answered a connect request with CONNECT_FAIL.
    #[error("connection refused by peer: {} ({code})", fail_code_name(*code))]
    Refused { code: u16 },

    /// The stream (or one of its buffers) is closed.
    #[error("stream closed")]
    Closed,

    /// The stream has not reached the connected state.
    #[error("stream not connected")]
    NotConnected,

    /// The underlying channel did not accept a message.
    #[error("channel send failed")]
    ChannelFailure,

    /// The stream port already has a registered server.
    #[error("stream port {0} already has a listener")]
    PortInUse(u16),

    /// A stream server's pending-connection queue is full.
    #[error("pending connection queue full on stream port {0}")]
    PendingExceeded(u16),

    /// Configuration values are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON configuration could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operating-system level failure (thread spawn, socket).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, MuxError>;

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        let kind = match &err {
            MuxError::Io(inner) => return io::Error::new(inner.kind(), err.to_string()),
            MuxError::Closed => io::ErrorKind::BrokenPipe,
            MuxError::NotConnected => io::ErrorKind::NotConnected,
            MuxError::Timeout { .. } => io::ErrorKind::TimedOut,
            MuxError::Refused { .. } => io::ErrorKind::ConnectionRefused,
            MuxError::ChannelFailure | MuxError::ProtocolSequence(_) => {
                io::ErrorKind::ConnectionAborted
            }
            MuxError::InvalidArgument(_) | MuxError::InvalidConfig(_) => {
                io::ErrorKind::InvalidInput
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streammux_wire::NO_LISTENER;

    #[test]
    fn refused_names_the_code() {
        let err = MuxError::Refused { code: NO_LISTENER };
        assert_eq!(
            err.to_string(),
            "connection refused by peer: NO_LISTENER (1001)"
        );
    }

    #[test]
    fn converts_to_io_error_kinds() {
        let closed: io::Error = MuxError::Closed.into();
        assert_eq!(closed.kind(), io::ErrorKind::BrokenPipe);

        let timeout: io::Error = MuxError::Timeout {
            operation: "connect",
            timeout: Duration::from_millis(5),
        }
        .into();
        assert_eq!(timeout.kind(), io::ErrorKind::TimedOut);

        let refused: io::Error = MuxError::Refused { code: 2001 }.into();
        assert_eq!(refused.kind(), io::ErrorKind::ConnectionRefused);
    }
}
