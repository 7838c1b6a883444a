//! The stream controller: sole owner of the id space, the stream and
//! listener registries, and the underlying channel.
//!
//! Two loops run per controller. The dispatch loop drains the channel and
//! routes every message with non-blocking offers, so a slow stream can never
//! stall it. CONNECT_REQUEST messages go to a separate connect loop, which
//! builds inbound streams and hands them to the matching server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use streammux_wire::{
    buffer_type, peek_stream_id, Message, MessageType, MAX_STREAMS_EXCEEDED, NO_LISTENER,
    START_FAILURE,
};
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::registry::{ListenerRegistry, StreamRegistry};
use crate::server::{Backlog, StreamServer};
use crate::stream::{Stream, StreamHost};

struct ConnectRequest {
    priority: u8,
    remote_id: u8,
    port: u16,
}

pub(crate) struct ControllerInner {
    channel: Arc<dyn Channel>,
    config: MuxConfig,
    streams: StreamRegistry,
    listeners: ListenerRegistry,
    connect_tx: Sender<ConnectRequest>,
    stop_tx: Mutex<Option<Sender<()>>>,
    running: AtomicBool,
}

/// Multiplexes streams over one [`Channel`].
///
/// Dropping the controller shuts it down.
pub struct StreamController {
    inner: Arc<ControllerInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamController {
    /// Start a controller over `channel`.
    pub fn new(channel: Arc<dyn Channel>, config: MuxConfig) -> Result<Self> {
        config.validate()?;
        let (inner, connect_rx, stop_rx) = ControllerInner::new(channel, config);

        let dispatch = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("streammux-dispatch".to_string())
                .spawn(move || inner.run_dispatch_loop())
        };
        let dispatch = match dispatch {
            Ok(handle) => handle,
            Err(err) => {
                inner.teardown();
                return Err(err.into());
            }
        };

        let connect = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("streammux-connect".to_string())
                .spawn(move || inner.run_connect_loop(connect_rx, stop_rx))
        };
        let connect = match connect {
            Ok(handle) => handle,
            Err(err) => {
                inner.teardown();
                let _ = dispatch.join();
                return Err(err.into());
            }
        };

        info!(
            max_streams = inner.config.max_streams,
            window_size = inner.config.window_size,
            "stream controller started"
        );
        Ok(Self {
            inner,
            threads: Mutex::new(vec![dispatch, connect]),
        })
    }

    /// Start a controller with [`MuxConfig::default`].
    pub fn with_defaults(channel: Arc<dyn Channel>) -> Result<Self> {
        Self::new(channel, MuxConfig::default())
    }

    /// Open a stream to `port` on the peer using the configured deadline.
    pub fn connect(&self, port: u16, priority: u8) -> Result<Arc<Stream>> {
        self.connect_timeout(port, priority, self.inner.config.connect_timeout())
    }

    pub fn connect_timeout(
        &self,
        port: u16,
        priority: u8,
        timeout: Duration,
    ) -> Result<Arc<Stream>> {
        if !self.is_running() {
            return Err(MuxError::Closed);
        }
        let stream = Stream::new(self.inner.host_handle(), priority, &self.inner.config);
        stream.connect(port, timeout)?;
        Ok(stream)
    }

    /// Bind a stream server to `port`; port 0 picks the lowest free port.
    pub fn bind(&self, port: u16) -> Result<StreamServer> {
        if !self.is_running() {
            return Err(MuxError::Closed);
        }
        let depth = self.inner.config.pending_accept_depth;
        let backlog = self
            .inner
            .listeners
            .register_with(port, |assigned| Arc::new(Backlog::new(assigned, depth)))?;
        debug!(port = backlog.port(), "stream server bound");
        Ok(StreamServer::new(
            backlog,
            Arc::downgrade(&self.inner),
            self.inner.config.connect_timeout(),
        ))
    }

    /// Unbind whatever server holds `port`.
    pub fn deregister_stream_server(&self, port: u16) -> bool {
        self.inner.deregister_listener(port)
    }

    /// Hand one message to the channel.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.inner.send_message(message)
    }

    pub fn register_stream(&self, stream: Arc<Stream>) -> Result<u8> {
        self.inner.register(stream)
    }

    pub fn deregister_stream(&self, id: u8) -> bool {
        self.inner.deregister(id)
    }

    pub fn stream(&self, id: u8) -> Option<Arc<Stream>> {
        self.inner.streams.get(id)
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn listener_ports(&self) -> Vec<u16> {
        self.inner.listeners.ports()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop both loops, abort every stream and server, and close the channel.
    pub fn shutdown(&self) {
        self.inner.teardown();
        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type LoopInputs = (Arc<ControllerInner>, Receiver<ConnectRequest>, Receiver<()>);

impl ControllerInner {
    /// Build the shared state; the caller runs the loops on the receivers.
    fn new(channel: Arc<dyn Channel>, config: MuxConfig) -> LoopInputs {
        let (connect_tx, connect_rx) = crossbeam_channel::bounded(config.connect_queue_depth);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let inner = Arc::new(Self {
            channel,
            streams: StreamRegistry::new(config.max_streams),
            listeners: ListenerRegistry::new(),
            connect_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            running: AtomicBool::new(true),
            config,
        });
        (inner, connect_rx, stop_rx)
    }

    fn host_handle(self: &Arc<Self>) -> Weak<dyn StreamHost> {
        Arc::downgrade(self) as Weak<dyn StreamHost>
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        let encoded = message.to_bytes()?;
        self.sent(message, self.channel.send(encoded))
    }

    /// Non-blocking send used by the connect loop; a full channel is a
    /// channel failure.
    fn offer_message(&self, message: &Message) -> Result<()> {
        let encoded = message.to_bytes()?;
        self.sent(message, self.channel.try_send(encoded))
    }

    fn sent(&self, message: &Message, accepted: bool) -> Result<()> {
        if !accepted {
            return Err(MuxError::ChannelFailure);
        }
        trace!(
            stream_id = message.stream_id(),
            kind = %message.message_type(),
            "message sent"
        );
        Ok(())
    }

    fn register(&self, stream: Arc<Stream>) -> Result<u8> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(MuxError::Closed);
        }
        let id = self.streams.register(stream)?;
        debug!(stream_id = id, "stream registered");
        Ok(id)
    }

    fn deregister(&self, id: u8) -> bool {
        match self.streams.remove(id) {
            Some(stream) => {
                stream.abort();
                debug!(stream_id = id, "stream deregistered");
                true
            }
            None => false,
        }
    }

    /// Remove the listener on `port` and abort its unclaimed streams.
    pub(crate) fn deregister_listener(&self, port: u16) -> bool {
        let Some(backlog) = self.listeners.remove(port) else {
            return false;
        };
        for stream in backlog.close() {
            if let Some(id) = stream.local_id() {
                self.deregister(id);
            }
        }
        debug!(port, "stream server closed");
        true
    }

    fn run_dispatch_loop(self: Arc<Self>) {
        while let Some(envelope) = self.channel.recv() {
            if envelope.is_shutdown() || !self.dispatch(envelope.into_message()) {
                debug!("dispatch loop received teardown sentinel");
                break;
            }
        }
        debug!("dispatch loop stopped");
        self.teardown();
    }

    /// Route one inbound message. Returns false on the teardown sentinel.
    fn dispatch(&self, encoded: Bytes) -> bool {
        let kind = match buffer_type(&encoded) {
            Ok(MessageType::Shutdown) => return false,
            Ok(kind) => kind,
            Err(err) => {
                warn!(stream_id = ?peek_stream_id(&encoded), error = %err, "dropping unclassifiable message");
                return true;
            }
        };
        let message = match Message::decode(encoded.clone()) {
            Ok(message) => message,
            Err(err) => {
                warn!(stream_id = ?peek_stream_id(&encoded), kind = %kind, error = %err, "dropping malformed message");
                return true;
            }
        };

        match message {
            Message::ConnectRequest {
                priority,
                stream_id,
                port,
            } => {
                let request = ConnectRequest {
                    priority,
                    remote_id: stream_id,
                    port,
                };
                if self.connect_tx.try_send(request).is_err() {
                    warn!(port, remote_id = stream_id, "connect queue full, dropping request");
                }
            }
            message => {
                let id = message.stream_id();
                match self.streams.get(id) {
                    Some(stream) => {
                        if !stream.deliver(message) {
                            warn!(stream_id = id, kind = %kind, "stream inbound queue full, dropping message");
                        }
                    }
                    None => {
                        warn!(stream_id = id, kind = %kind, "dropping message for unknown stream");
                    }
                }
            }
        }
        true
    }

    fn run_connect_loop(self: Arc<Self>, requests: Receiver<ConnectRequest>, stop: Receiver<()>) {
        loop {
            let request = select! {
                recv(requests) -> request => match request {
                    Ok(request) => request,
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            };
            self.handle_connect(request);
        }
        debug!("connect loop stopped");
    }

    fn handle_connect(self: &Arc<Self>, request: ConnectRequest) {
        let ConnectRequest {
            priority,
            remote_id,
            port,
        } = request;

        let Some(backlog) = self.listeners.get(port) else {
            debug!(port, remote_id, "no listener for connect request");
            self.refuse(priority, remote_id, NO_LISTENER);
            return;
        };

        let stream = Stream::new(self.host_handle(), priority, &self.config);
        let id = match self.streams.register(stream.clone()) {
            Ok(id) => id,
            Err(err) => {
                debug!(port, remote_id, error = %err, "refusing connect request");
                self.refuse(priority, remote_id, MAX_STREAMS_EXCEEDED);
                return;
            }
        };
        stream.prepare_inbound(remote_id, port);

        if let Err(err) = stream.start() {
            warn!(stream_id = id, error = %err, "failed to start inbound stream");
            self.deregister(id);
            self.refuse(priority, remote_id, START_FAILURE);
            return;
        }

        if let Err(err) = backlog.connect_stream(stream) {
            debug!(stream_id = id, port, error = %err, "inbound stream not queued");
            self.deregister(id);
        }
    }

    fn refuse(&self, priority: u8, remote_id: u8, code: u16) {
        let fail = Message::ConnectFail {
            priority,
            stream_id: remote_id,
            code,
        };
        if let Err(err) = self.offer_message(&fail) {
            warn!(remote_id, code, error = %err, "failed to send connect failure");
        }
    }

    /// Idempotent: stop the loops, abort streams and servers, close the channel.
    fn teardown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.lock().take();
        for port in self.listeners.ports() {
            self.deregister_listener(port);
        }
        for id in self.streams.ids() {
            self.deregister(id);
        }
        self.channel.close();
        info!("stream controller shut down");
    }
}

impl StreamHost for ControllerInner {
    fn send(&self, message: &Message) -> Result<()> {
        self.send_message(message)
    }

    fn offer(&self, message: &Message) -> Result<()> {
        self.offer_message(message)
    }

    fn register_stream(&self, stream: Arc<Stream>) -> Result<u8> {
        self.register(stream)
    }

    fn deregister_stream(&self, id: u8) -> bool {
        self.deregister(id)
    }
}
