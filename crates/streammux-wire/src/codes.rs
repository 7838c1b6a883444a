//! CONNECT_FAIL reason codes.
//!
//! Codes 1000-1999 report a condition of the whole controller.
//! Codes 2000-2999 report a condition of the target stream port.

/// No stream server is registered on the requested stream port.
pub const NO_LISTENER: u16 = 1001;

/// The responding controller has no free stream id.
pub const MAX_STREAMS_EXCEEDED: u16 = 1002;

/// The responding side could not start the stream's background tasks.
pub const START_FAILURE: u16 = 1003;

/// The stream server's pending-connection queue is full.
pub const PENDING_EXCEEDED: u16 = 2001;

/// Returns a human-readable name for a CONNECT_FAIL code.
pub fn fail_code_name(code: u16) -> &'static str {
    match code {
        NO_LISTENER => "NO_LISTENER",
        MAX_STREAMS_EXCEEDED => "MAX_STREAMS_EXCEEDED",
        START_FAILURE => "START_FAILURE",
        PENDING_EXCEEDED => "PENDING_EXCEEDED",
        1000..=1999 => "CONTROLLER",
        2000..=2999 => "PORT",
        _ => "UNKNOWN",
    }
}
