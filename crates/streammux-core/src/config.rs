use std::time::Duration;

use serde::{Deserialize, Serialize};
use streammux_wire::FrameConfig;

use crate::error::{MuxError, Result};

/// Stream ids are one byte on the wire.
pub const MAX_STREAM_IDS: usize = 256;

/// Tunables for one stream controller and the streams it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Maximum number of concurrently registered streams (1..=256).
    pub max_streams: usize,
    /// Initial flow-control window, and the capacity of each input buffer.
    pub window_size: usize,
    /// Capacity of each stream's outbound transit buffer.
    pub output_buffer_size: usize,
    /// Depth of each stream's private inbound message queue.
    pub inbound_queue_depth: usize,
    /// Depth of the controller's connect-request queue.
    pub connect_queue_depth: usize,
    /// Accepted-but-unclaimed streams a server holds before refusing.
    pub pending_accept_depth: usize,
    /// Default deadline for `connect`, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Default deadline for `close`, in milliseconds.
    pub close_timeout_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: 100,
            window_size: 4096,
            output_buffer_size: 4096,
            inbound_queue_depth: 64,
            connect_queue_depth: 16,
            pending_accept_depth: 16,
            connect_timeout_ms: 5_000,
            close_timeout_ms: 5_000,
        }
    }
}

impl MuxConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_streams == 0 || self.max_streams > MAX_STREAM_IDS {
            return Err(MuxError::InvalidConfig(format!(
                "max_streams must be in 1..={MAX_STREAM_IDS}, got {}",
                self.max_streams
            )));
        }

        let sizes = [
            ("window_size", self.window_size),
            ("output_buffer_size", self.output_buffer_size),
            ("inbound_queue_depth", self.inbound_queue_depth),
            ("connect_queue_depth", self.connect_queue_depth),
            ("pending_accept_depth", self.pending_accept_depth),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(MuxError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }

        if self.connect_timeout_ms == 0 || self.close_timeout_ms == 0 {
            return Err(MuxError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Configuration for a [`PriorityLink`](crate::link::PriorityLink).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bound of both the receive and the transmit priority queue.
    pub queue_depth: usize,
    /// Framing limits and socket timeouts.
    pub frame: FrameConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            frame: FrameConfig::default(),
        }
    }
}
