use std::fmt;
use std::io;

use streammux_core::MuxError;
use streammux_wire::WireError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => TRANSPORT_ERROR,
        io::ErrorKind::InvalidInput => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn wire_error(context: &str, err: WireError) -> CliError {
    match err {
        WireError::Io(source) => io_error(context, source),
        WireError::ConnectionClosed => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn mux_error(context: &str, err: MuxError) -> CliError {
    match err {
        MuxError::Wire(err) => wire_error(context, err),
        MuxError::Io(err) => io_error(context, err),
        MuxError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        MuxError::Refused { .. } => CliError::new(FAILURE, format!("{context}: {err}")),
        MuxError::Closed
        | MuxError::NotConnected
        | MuxError::ChannelFailure
        | MuxError::ProtocolSequence(_)
        | MuxError::FlowControl { .. } => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        MuxError::InvalidConfig(_) | MuxError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        MuxError::InvalidArgument(_) | MuxError::PortInUse(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn refused_connect_is_plain_failure() {
        let err = mux_error("connect failed", MuxError::Refused { code: 1001 });
        assert_eq!(err.code, FAILURE);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn timeouts_map_to_timeout_code() {
        let err = mux_error(
            "connect failed",
            MuxError::Timeout {
                operation: "connect",
                timeout: Duration::from_secs(1),
            },
        );
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn missing_socket_is_transport_error() {
        let err = io_error(
            "connect failed",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
    }

    #[test]
    fn bad_config_is_data_invalid() {
        let err = mux_error("config", MuxError::InvalidConfig("max_streams".into()));
        assert_eq!(err.code, DATA_INVALID);
        let err = mux_error(
            "config",
            MuxError::Wire(WireError::PayloadTooLarge { size: 10, max: 5 }),
        );
        assert_eq!(err.code, DATA_INVALID);
    }

    #[test]
    fn resource_exhaustion_is_internal() {
        let err = mux_error("connect failed", MuxError::ResourceExhausted("ids".into()));
        assert_eq!(err.code, INTERNAL);
    }
}
