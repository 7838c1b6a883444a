//! One multiplexed virtual connection.
//!
//! A [`Stream`] runs three background loops once it is started:
//!
//! - the receive loop drains the stream's private inbound queue and is the
//!   only place protocol messages move the state machine
//! - the sender loop moves buffered output onto the wire as the peer's
//!   window allows
//! - the credit loop turns bytes freed by reads into BUFFER_INCREMENT
//!   messages
//!
//! Deadline-bound `connect` and `close` may also force the stream into
//! [`StreamState::Error`]; every other transition happens on the receive
//! loop.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use streammux_wire::{fail_code_name, Message, MAX_DATA_PAYLOAD, SHUTDOWN_PRIORITY};
use tracing::{debug, warn};

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::completion::Completion;
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Unconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
    Error,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconnected => "UNCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stream needs from the controller that owns it.
pub trait StreamHost: Send + Sync {
    /// Hand one message to the underlying channel.
    fn send(&self, message: &Message) -> Result<()>;

    /// Like [`StreamHost::send`], but fails instead of waiting for room.
    fn offer(&self, message: &Message) -> Result<()> {
        self.send(message)
    }

    /// Allocate an id for `stream` and start routing messages to it.
    fn register_stream(&self, stream: Arc<Stream>) -> Result<u8>;

    /// Stop routing to `id` and free it. Returns false if it was unknown.
    fn deregister_stream(&self, id: u8) -> bool;
}

type Signal = Arc<Completion<Result<()>>>;

struct Pending {
    connect: Option<Signal>,
    close: Option<Signal>,
}

impl Pending {
    fn resolve(self, result: Result<()>) {
        if let Some(signal) = self.connect.or(self.close) {
            signal.complete(result);
        }
    }
}

struct StreamInner {
    state: StreamState,
    remote_id: Option<u8>,
    port: Option<u16>,
    pending_connect: Option<Signal>,
    pending_close: Option<Signal>,
}

impl StreamInner {
    fn take_pending(&mut self) -> Pending {
        Pending {
            connect: self.pending_connect.take(),
            close: self.pending_close.take(),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct Stream {
    host: Weak<dyn StreamHost>,
    priority: u8,
    local_id: OnceLock<u8>,
    inner: Mutex<StreamInner>,
    inbound_tx: Sender<Message>,
    inbound_rx: Receiver<Message>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    input: InputBuffer,
    freed_rx: Receiver<usize>,
    output: OutputBuffer,
    started: AtomicBool,
    deregistered: AtomicBool,
}

impl Stream {
    /// Create an unconnected stream that will send at `priority`.
    pub fn new(host: Weak<dyn StreamHost>, priority: u8, config: &MuxConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(config.inbound_queue_depth);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let (input, freed_rx) = InputBuffer::new(config.window_size);
        Arc::new(Self {
            host,
            priority,
            local_id: OnceLock::new(),
            inner: Mutex::new(StreamInner {
                state: StreamState::Unconnected,
                remote_id: None,
                port: None,
                pending_connect: None,
                pending_close: None,
            }),
            inbound_tx,
            inbound_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            input,
            freed_rx,
            output: OutputBuffer::new(config.output_buffer_size, config.window_size),
            started: AtomicBool::new(false),
            deregistered: AtomicBool::new(false),
        })
    }

    pub fn local_id(&self) -> Option<u8> {
        self.local_id.get().copied()
    }

    /// The peer's id for this stream; authoritative once connected.
    pub fn remote_id(&self) -> Option<u8> {
        self.inner.lock().remote_id
    }

    /// The stream port this stream was opened to or accepted on.
    pub fn port(&self) -> Option<u16> {
        self.inner.lock().port
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == StreamState::Connected
    }

    /// True once the stream is closing, closed or failed.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Closing | StreamState::Closed | StreamState::Error
        )
    }

    /// Open this stream to `port` on the peer, waiting up to `timeout` for
    /// the answer.
    pub fn connect(self: &Arc<Self>, port: u16, timeout: Duration) -> Result<()> {
        if self.priority == SHUTDOWN_PRIORITY {
            return Err(MuxError::InvalidArgument(
                "priority 0 is reserved for shutdown signaling".to_string(),
            ));
        }
        let state = self.state();
        if state != StreamState::Unconnected {
            return Err(MuxError::InvalidArgument(format!(
                "connect on a {state} stream"
            )));
        }

        let host = self.host()?;
        let id = host.register_stream(self.clone())?;
        if let Err(err) = self.start() {
            self.fail(MuxError::Closed);
            return Err(err);
        }

        let pending = Arc::new(Completion::new());
        {
            let mut inner = self.inner.lock();
            inner.state = StreamState::Connecting;
            inner.port = Some(port);
            inner.pending_connect = Some(pending.clone());
        }
        debug!(stream_id = id, port, priority = self.priority, "connecting stream");

        let request = Message::ConnectRequest {
            priority: self.priority,
            stream_id: id,
            port,
        };
        if let Err(err) = host.send(&request) {
            self.fail(MuxError::ChannelFailure);
            return Err(err);
        }
        drop(host);

        match pending.wait_timeout(timeout) {
            Some(result) => result,
            None => {
                let expired = MuxError::Timeout {
                    operation: "connect",
                    timeout,
                };
                if self.fail_from(StreamState::Connecting, expired) {
                    Err(MuxError::Timeout {
                        operation: "connect",
                        timeout,
                    })
                } else {
                    // Answered just as the deadline passed.
                    pending.try_take().unwrap_or(Err(MuxError::Closed))
                }
            }
        }
    }

    /// Flush pending output, then perform the disconnect handshake.
    ///
    /// A close that misses its deadline still tears the stream down, leaving
    /// it in ERROR.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        match self.state() {
            StreamState::Connected => {}
            StreamState::Closed => return Ok(()),
            StreamState::Closing => {
                return Err(MuxError::ProtocolSequence(
                    "close already in progress".to_string(),
                ))
            }
            StreamState::Error => return Err(MuxError::Closed),
            StreamState::Unconnected | StreamState::Connecting => {
                return Err(MuxError::NotConnected)
            }
        }

        if !self.output.drain(Some(deadline)) {
            if self.output.is_closed() {
                // The peer closed or the stream failed while we were flushing.
                return match self.state() {
                    StreamState::Closed => Ok(()),
                    _ => Err(MuxError::Closed),
                };
            }
            self.fail(MuxError::Timeout {
                operation: "close",
                timeout,
            });
            return Err(MuxError::Timeout {
                operation: "close",
                timeout,
            });
        }

        let pending = Arc::new(Completion::new());
        let remote_id = {
            let mut inner = self.inner.lock();
            match inner.state {
                StreamState::Connected => {}
                StreamState::Closed => return Ok(()),
                _ => return Err(MuxError::Closed),
            }
            let remote_id = inner.remote_id.ok_or(MuxError::NotConnected)?;
            inner.state = StreamState::Closing;
            inner.pending_close = Some(pending.clone());
            remote_id
        };
        debug!(stream_id = ?self.local_id(), remote_id, "closing stream");

        let request = Message::DisconnectRequest {
            priority: self.priority,
            stream_id: remote_id,
        };
        if let Err(err) = self.send(request) {
            self.fail(MuxError::ChannelFailure);
            return Err(err);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match pending.wait_timeout(remaining) {
            Some(result) => result,
            None => {
                let expired = MuxError::Timeout {
                    operation: "close",
                    timeout,
                };
                if self.fail_from(StreamState::Closing, expired) {
                    Err(MuxError::Timeout {
                        operation: "close",
                        timeout,
                    })
                } else {
                    pending.try_take().unwrap_or(Ok(()))
                }
            }
        }
    }

    /// Read buffered peer data, waiting for at least one byte.
    ///
    /// Returns `Ok(0)` after the peer closed and all its data was read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.state() {
            StreamState::Unconnected | StreamState::Connecting => Err(MuxError::NotConnected),
            _ => self.input.read(buf),
        }
    }

    /// Buffer bytes for sending, waiting while the output buffer is full.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match self.state() {
            StreamState::Connected => self.output.write(buf),
            StreamState::Unconnected | StreamState::Connecting => Err(MuxError::NotConnected),
            _ => Err(MuxError::Closed),
        }
    }

    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Wait until every written byte has been handed to the channel.
    pub fn flush(&self) -> Result<()> {
        if self.output.drain(None) {
            Ok(())
        } else {
            Err(MuxError::Closed)
        }
    }

    pub(crate) fn assign_id(&self, id: u8) -> Result<()> {
        self.local_id
            .set(id)
            .map_err(|_| MuxError::InvalidArgument("stream already has an id".to_string()))
    }

    /// Queue a routed message for the receive loop without blocking.
    pub(crate) fn deliver(&self, message: Message) -> bool {
        self.inbound_tx.try_send(message).is_ok()
    }

    /// Spawn the stream's background loops. Idempotent.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let label = self
            .local_id()
            .map_or_else(|| "new".to_string(), |id| id.to_string());

        let receiver = self.clone();
        let inbound = self.inbound_rx.clone();
        let stop = self.stop_rx.clone();
        thread::Builder::new()
            .name(format!("streammux-stream-{label}-rx"))
            .spawn(move || receiver.run_receive_loop(inbound, stop))?;

        let sender = self.clone();
        thread::Builder::new()
            .name(format!("streammux-stream-{label}-tx"))
            .spawn(move || sender.run_sender_loop())?;

        let forwarder = self.clone();
        let freed = self.freed_rx.clone();
        let stop = self.stop_rx.clone();
        thread::Builder::new()
            .name(format!("streammux-stream-{label}-credit"))
            .spawn(move || forwarder.run_credit_loop(freed, stop))?;
        Ok(())
    }

    /// Mark an inbound stream as answering a peer's connect request.
    pub(crate) fn prepare_inbound(&self, remote_id: u8, port: u16) {
        let mut inner = self.inner.lock();
        inner.state = StreamState::Connecting;
        inner.remote_id = Some(remote_id);
        inner.port = Some(port);
    }

    /// Accept the peer's connect request: go CONNECTED and send CONNECT_CONFIRM.
    pub(crate) fn confirm_inbound(&self) -> Result<()> {
        let local_id = self.local_id().ok_or(MuxError::NotConnected)?;
        let remote_id = {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Connecting {
                return Err(MuxError::ProtocolSequence(format!(
                    "confirm on a {} stream",
                    inner.state
                )));
            }
            let remote_id = inner.remote_id.ok_or(MuxError::NotConnected)?;
            inner.state = StreamState::Connected;
            remote_id
        };

        let confirm = Message::ConnectConfirm {
            priority: self.priority,
            stream_id: remote_id,
            assigned_id: local_id,
        };
        if let Err(err) = self.host()?.offer(&confirm) {
            self.fail(MuxError::ChannelFailure);
            return Err(err);
        }
        debug!(stream_id = local_id, remote_id, "stream accepted");
        Ok(())
    }

    /// Answer the peer's connect request with CONNECT_FAIL.
    pub(crate) fn refuse(&self, code: u16) -> Result<()> {
        let remote_id = self.remote_id().ok_or(MuxError::NotConnected)?;
        self.host()?.offer(&Message::ConnectFail {
            priority: self.priority,
            stream_id: remote_id,
            code,
        })
    }

    /// Called by the controller once the stream has left its registry.
    pub(crate) fn abort(&self) {
        self.deregistered.store(true, Ordering::SeqCst);
        let pending = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = StreamState::Error;
            inner.take_pending()
        };
        debug!(stream_id = ?self.local_id(), "stream aborted");
        self.shutdown_io(true);
        pending.resolve(Err(MuxError::Closed));
    }

    fn host(&self) -> Result<Arc<dyn StreamHost>> {
        self.host.upgrade().ok_or(MuxError::ChannelFailure)
    }

    fn send(&self, message: Message) -> Result<()> {
        self.host()?.send(&message)
    }

    fn run_receive_loop(self: Arc<Self>, inbound: Receiver<Message>, stop: Receiver<()>) {
        loop {
            let message = select! {
                recv(inbound) -> message => match message {
                    Ok(message) => message,
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            };
            if let Flow::Stop = self.handle_message(message) {
                break;
            }
        }
        debug!(stream_id = ?self.local_id(), "stream receive loop stopped");
    }

    fn handle_message(&self, message: Message) -> Flow {
        let state = self.state();
        match (state, message) {
            (StreamState::Connecting, Message::ConnectConfirm { assigned_id, .. }) => {
                let pending = {
                    let mut inner = self.inner.lock();
                    if inner.state != StreamState::Connecting {
                        return Flow::Stop;
                    }
                    inner.state = StreamState::Connected;
                    inner.remote_id = Some(assigned_id);
                    inner.pending_connect.take()
                };
                debug!(stream_id = ?self.local_id(), remote_id = assigned_id, "stream connected");
                if let Some(pending) = pending {
                    pending.complete(Ok(()));
                }
                Flow::Continue
            }
            (StreamState::Connecting, Message::ConnectFail { code, .. }) => {
                if let Some(pending) = self.transition(StreamState::Connecting, StreamState::Closed)
                {
                    debug!(
                        stream_id = ?self.local_id(),
                        code,
                        reason = fail_code_name(code),
                        "connect refused"
                    );
                    self.shutdown_io(true);
                    self.release();
                    pending.resolve(Err(MuxError::Refused { code }));
                }
                Flow::Stop
            }
            (StreamState::Connected, Message::Data { payload, .. }) => {
                match self.input.write_from_peer(&payload) {
                    Ok(()) => Flow::Continue,
                    Err(err) => {
                        self.fail(err);
                        Flow::Stop
                    }
                }
            }
            (StreamState::Connected, Message::BufferIncrement { increment, .. }) => {
                self.output.increase_remote_available(usize::from(increment));
                Flow::Continue
            }
            (
                StreamState::Connected | StreamState::Closing,
                Message::DisconnectRequest { .. },
            ) => {
                let Some(pending) = self.transition(state, StreamState::Closed) else {
                    return Flow::Stop;
                };
                if let Some(remote_id) = self.remote_id() {
                    let confirm = Message::DisconnectConfirm {
                        priority: self.priority,
                        stream_id: remote_id,
                    };
                    if let Err(err) = self.send(confirm) {
                        warn!(stream_id = ?self.local_id(), error = %err, "failed to confirm disconnect");
                    }
                }
                debug!(stream_id = ?self.local_id(), "stream closed by peer");
                // A local close already in progress discards unread input.
                self.shutdown_io(state == StreamState::Closing);
                self.release();
                pending.resolve(Ok(()));
                Flow::Stop
            }
            (StreamState::Closing, Message::DisconnectConfirm { .. }) => {
                if let Some(pending) = self.transition(StreamState::Closing, StreamState::Closed) {
                    debug!(stream_id = ?self.local_id(), "stream closed");
                    self.shutdown_io(true);
                    self.release();
                    pending.resolve(Ok(()));
                }
                Flow::Stop
            }
            (
                StreamState::Closing,
                message @ (Message::Data { .. } | Message::BufferIncrement { .. }),
            ) => {
                debug!(
                    stream_id = ?self.local_id(),
                    kind = %message.message_type(),
                    "discarding message on closing stream"
                );
                Flow::Continue
            }
            (state, message) => {
                self.fail(MuxError::ProtocolSequence(format!(
                    "unexpected {} while {state}",
                    message.message_type()
                )));
                Flow::Stop
            }
        }
    }

    fn run_sender_loop(self: Arc<Self>) {
        while let Ok(chunk) = self.output.take_for_send() {
            let len = chunk.len();
            let result = match self.remote_id() {
                Some(remote_id) => self.send(Message::Data {
                    priority: self.priority,
                    stream_id: remote_id,
                    payload: chunk,
                }),
                None => Err(MuxError::NotConnected),
            };
            self.output.complete_send(len);
            if let Err(err) = result {
                self.fail(err);
                break;
            }
        }
        debug!(stream_id = ?self.local_id(), "stream sender loop stopped");
    }

    fn run_credit_loop(self: Arc<Self>, freed: Receiver<usize>, stop: Receiver<()>) {
        loop {
            let mut total = select! {
                recv(freed) -> n => match n {
                    Ok(n) => n,
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            };
            total += freed.try_iter().sum::<usize>();

            // Window updates mean nothing once the peer has stopped listening.
            if !self.is_connected() {
                continue;
            }
            let Some(remote_id) = self.remote_id() else {
                continue;
            };
            while total > 0 {
                let step = total.min(MAX_DATA_PAYLOAD);
                let increment = Message::BufferIncrement {
                    priority: self.priority,
                    stream_id: remote_id,
                    increment: step as u16,
                };
                if let Err(err) = self.send(increment) {
                    warn!(stream_id = ?self.local_id(), error = %err, "failed to send buffer increment");
                    break;
                }
                total -= step;
            }
        }
    }

    /// Move `from` -> `to` under the lock, handing back pending completions.
    fn transition(&self, from: StreamState, to: StreamState) -> Option<Pending> {
        let mut inner = self.inner.lock();
        if inner.state != from {
            return None;
        }
        inner.state = to;
        Some(inner.take_pending())
    }

    /// Force ERROR unless already terminal. Returns whether this call did it.
    fn fail(&self, err: MuxError) -> bool {
        self.fail_when(|_| true, err)
    }

    fn fail_from(&self, expected: StreamState, err: MuxError) -> bool {
        self.fail_when(|state| state == expected, err)
    }

    fn fail_when(&self, allowed: impl Fn(StreamState) -> bool, err: MuxError) -> bool {
        let (from, pending) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() || !allowed(inner.state) {
                return false;
            }
            let from = inner.state;
            inner.state = StreamState::Error;
            (from, inner.take_pending())
        };
        warn!(stream_id = ?self.local_id(), state = %from, error = %err, "stream failed");
        self.shutdown_io(true);
        self.release();
        pending.resolve(Err(err));
        true
    }

    fn shutdown_io(&self, discard_input: bool) {
        if discard_input {
            self.input.close();
        } else {
            self.input.finish();
        }
        self.output.close();
        self.stop_tx.lock().take();
    }

    /// Deregister from the host exactly once.
    fn release(&self) {
        if self.deregistered.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (Some(id), Some(host)) = (self.local_id(), self.host.upgrade()) {
            host.deregister_stream(id);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Stream")
            .field("local_id", &self.local_id())
            .field("remote_id", &inner.remote_id)
            .field("port", &inner.port)
            .field("priority", &self.priority)
            .field("state", &inner.state)
            .finish()
    }
}

impl io::Read for &Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for &Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Stream::flush(self).map_err(io::Error::from)
    }
}
