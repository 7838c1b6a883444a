use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use streammux_wire::{NO_LISTENER, PENDING_EXCEEDED};
use tracing::{debug, warn};

use crate::completion::Completion;
use crate::controller::ControllerInner;
use crate::error::{MuxError, Result};
use crate::stream::Stream;

struct PendingStream {
    confirmed: Arc<Completion<Result<()>>>,
    stream: Arc<Stream>,
}

/// Bounded queue of inbound streams waiting for `accept`, shared between a
/// [`StreamServer`] and the controller's listener registry.
pub(crate) struct Backlog {
    port: u16,
    queue_tx: Sender<PendingStream>,
    queue_rx: Receiver<PendingStream>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Backlog {
    pub(crate) fn new(port: u16, depth: usize) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(depth);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        Self {
            port,
            queue_tx,
            queue_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Queue an inbound stream for `accept`, then confirm it to the peer.
    ///
    /// A full queue answers CONNECT_FAIL instead; the caller deregisters the
    /// stream on any error. Holds the shutdown lock throughout, so a
    /// concurrent [`Backlog::close`] either sees the stream or refuses it.
    pub(crate) fn connect_stream(&self, stream: Arc<Stream>) -> Result<()> {
        let open = self.shutdown_tx.lock();
        if open.is_none() {
            if let Err(err) = stream.refuse(NO_LISTENER) {
                warn!(port = self.port, error = %err, "failed to refuse stream");
            }
            return Err(MuxError::Closed);
        }

        let confirmed = Arc::new(Completion::new());
        let entry = PendingStream {
            confirmed: confirmed.clone(),
            stream: stream.clone(),
        };
        if self.queue_tx.try_send(entry).is_err() {
            debug!(port = self.port, "pending queue full");
            if let Err(err) = stream.refuse(PENDING_EXCEEDED) {
                warn!(port = self.port, error = %err, "failed to refuse stream");
            }
            return Err(MuxError::PendingExceeded(self.port));
        }

        match stream.confirm_inbound() {
            Ok(()) => {
                confirmed.complete(Ok(()));
                Ok(())
            }
            Err(err) => {
                confirmed.complete(Err(MuxError::ChannelFailure));
                Err(err)
            }
        }
    }

    /// Stop accepting and hand back whatever was still queued.
    pub(crate) fn close(&self) -> Vec<Arc<Stream>> {
        self.shutdown_tx.lock().take();
        self.queue_rx.try_iter().map(|entry| entry.stream).collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown_tx.lock().is_none()
    }
}

/// Listener bound to one stream port.
///
/// Dropping the server unbinds the port and aborts streams nobody accepted.
pub struct StreamServer {
    backlog: Arc<Backlog>,
    controller: Weak<ControllerInner>,
    confirm_wait: Duration,
}

impl StreamServer {
    pub(crate) fn new(
        backlog: Arc<Backlog>,
        controller: Weak<ControllerInner>,
        confirm_wait: Duration,
    ) -> Self {
        Self {
            backlog,
            controller,
            confirm_wait,
        }
    }

    pub fn port(&self) -> u16 {
        self.backlog.port
    }

    /// Wait for the next inbound stream.
    ///
    /// Only returns once CONNECT_CONFIRM has been sent for it.
    pub fn accept(&self) -> Result<Arc<Stream>> {
        self.accept_within(None)
    }

    pub fn accept_timeout(&self, timeout: Duration) -> Result<Arc<Stream>> {
        self.accept_within(Some(timeout))
    }

    /// Unbind the port and abort streams still waiting in the queue.
    pub fn close(&self) {
        if self.backlog.is_closed() {
            return;
        }
        match self.controller.upgrade() {
            Some(controller) => {
                controller.deregister_listener(self.port());
            }
            None => {
                self.backlog.close();
            }
        }
    }

    fn accept_within(&self, timeout: Option<Duration>) -> Result<Arc<Stream>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let queue = &self.backlog.queue_rx;
        let shutdown = &self.backlog.shutdown_rx;
        loop {
            let entry = match deadline {
                Some(deadline) => select! {
                    recv(queue) -> entry => entry.map_err(|_| MuxError::Closed)?,
                    recv(shutdown) -> _ => return Err(MuxError::Closed),
                    default(deadline.saturating_duration_since(Instant::now())) => {
                        return Err(MuxError::Timeout {
                            operation: "accept",
                            timeout: timeout.unwrap_or_default(),
                        })
                    }
                },
                None => select! {
                    recv(queue) -> entry => entry.map_err(|_| MuxError::Closed)?,
                    recv(shutdown) -> _ => return Err(MuxError::Closed),
                },
            };

            match entry.confirmed.wait_timeout(self.confirm_wait) {
                Some(Ok(())) => {
                    debug!(port = self.port(), stream_id = ?entry.stream.local_id(), "stream accepted");
                    return Ok(entry.stream);
                }
                Some(Err(err)) => {
                    debug!(port = self.port(), error = %err, "skipping stream that failed to confirm");
                }
                None => {
                    warn!(port = self.port(), "stream confirmation never arrived");
                }
            }
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("port", &self.port())
            .field("pending", &self.backlog.queue_rx.len())
            .finish()
    }
}
