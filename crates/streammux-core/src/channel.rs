use bytes::Bytes;

use crate::envelope::Envelope;

/// The ordered, reliable, message-oriented duplex a controller runs over.
///
/// Implementations deliver whole messages in (priority, arrival) order and
/// signal teardown by yielding a priority-0 envelope.
pub trait Channel: Send + Sync {
    /// Wait for the next inbound message.
    ///
    /// Returns `None` once the channel is closed and drained.
    fn recv(&self) -> Option<Envelope>;

    /// Queue one encoded message for transmission. Returns false if the
    /// channel did not accept it.
    fn send(&self, message: Bytes) -> bool;

    /// Queue one encoded message only if that needs no waiting. Returns
    /// false if the channel is full or did not accept it.
    fn try_send(&self, message: Bytes) -> bool;

    /// Flush what can be flushed and release the transport.
    fn close(&self);
}
