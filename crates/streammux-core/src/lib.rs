//! Flow-controlled stream multiplexing over one ordered message channel.
//!
//! A [`StreamController`] owns a [`Channel`] and carries up to 256
//! independent byte streams across it:
//! - [`Stream`] is one virtual connection with credit-based flow control
//! - [`StreamServer`] accepts inbound streams bound to a port
//! - [`PriorityLink`] runs the channel over any reliable byte stream
//!
//! Every message is tagged with a priority; lower values are delivered first
//! and priority 0 is reserved for the teardown sentinel.

pub mod buffer;
pub mod channel;
pub mod completion;
pub mod config;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod link;
pub mod queue;
mod registry;
pub mod server;
pub mod stream;

pub use buffer::{InputBuffer, OutputBuffer};
pub use channel::Channel;
pub use completion::Completion;
pub use config::{LinkConfig, MuxConfig, MAX_STREAM_IDS};
pub use controller::StreamController;
pub use envelope::{Envelope, Sequencer};
pub use error::{MuxError, Result};
pub use ids::IdAllocator;
pub use link::{Duplex, PriorityLink};
pub use queue::PriorityQueue;
pub use server::StreamServer;
pub use stream::{Stream, StreamHost, StreamState};
