//! Flow-controlled stream multiplexing over a single ordered channel.
//!
//! streammux carries many independent byte streams, each with its own
//! credit window, across one reliable message channel such as a Unix
//! socket, a TCP connection or a WebSocket.
//!
//! # Crate Structure
//!
//! - [`wire`]: Message codec and length-prefixed link framing
//! - [`core`]: Stream controller, streams, servers and the priority link

/// Re-export wire types.
pub mod wire {
    pub use streammux_wire::*;
}

/// Re-export mux types.
pub mod core {
    pub use streammux_core::*;
}
