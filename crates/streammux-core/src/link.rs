//! A [`Channel`] over any reliable byte stream.
//!
//! Messages travel in length-prefixed frames. Both directions go through a
//! [`PriorityQueue`]: the rx thread reads frames into the receive queue and
//! the tx thread writes the transmit queue out in priority order.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use streammux_wire::{FrameReader, FrameWriter, WireError, SHUTDOWN_PRIORITY};
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::config::LinkConfig;
use crate::envelope::{Envelope, Sequencer};
use crate::error::Result;
use crate::queue::PriorityQueue;

/// A blocking byte stream that can be split into independent halves.
pub trait Duplex: Read + Write + Send {
    fn try_clone_boxed(&self) -> io::Result<Box<dyn Duplex>>;

    /// Shut both directions down, waking any blocked reader.
    fn shutdown_both(&self) -> io::Result<()>;

    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()>;
}

impl Duplex for TcpStream {
    fn try_clone_boxed(&self) -> io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(read)?;
        self.set_write_timeout(write)
    }
}

#[cfg(unix)]
impl Duplex for std::os::unix::net::UnixStream {
    fn try_clone_boxed(&self) -> io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(read)?;
        self.set_write_timeout(write)
    }
}

/// Priority-ordered message link over a [`Duplex`] byte stream.
///
/// Dropping the link stops it.
pub struct PriorityLink {
    rx_queue: Arc<PriorityQueue>,
    tx_queue: Arc<PriorityQueue>,
    sequencer: Arc<Sequencer>,
    draining: AtomicBool,
    failed: Arc<AtomicBool>,
    socket: Mutex<Option<Box<dyn Duplex>>>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
    tx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PriorityLink {
    /// Take ownership of `stream` and start the rx and tx threads.
    pub fn start<D: Duplex + 'static>(stream: D, config: LinkConfig) -> Result<Self> {
        stream.set_timeouts(config.frame.read_timeout, config.frame.write_timeout)?;
        let reader = FrameReader::with_config(stream.try_clone_boxed()?, config.frame.clone());
        let writer = FrameWriter::with_config(stream.try_clone_boxed()?, config.frame.clone());

        let rx_queue = Arc::new(PriorityQueue::new(config.queue_depth));
        let tx_queue = Arc::new(PriorityQueue::new(config.queue_depth));
        let sequencer = Arc::new(Sequencer::new());
        let failed = Arc::new(AtomicBool::new(false));

        let rx_thread = {
            let queue = rx_queue.clone();
            let sequencer = sequencer.clone();
            thread::Builder::new()
                .name("streammux-link-rx".to_string())
                .spawn(move || run_rx_loop(reader, &queue, &sequencer))?
        };

        let link = Self {
            rx_queue,
            tx_queue,
            sequencer,
            draining: AtomicBool::new(false),
            failed,
            socket: Mutex::new(Some(Box::new(stream))),
            rx_thread: Mutex::new(Some(rx_thread)),
            tx_thread: Mutex::new(None),
        };

        let tx_thread = {
            let queue = link.tx_queue.clone();
            let failed = link.failed.clone();
            thread::Builder::new()
                .name("streammux-link-tx".to_string())
                .spawn(move || run_tx_loop(writer, &queue, &failed))?
        };
        *link.tx_thread.lock() = Some(tx_thread);
        debug!(queue_depth = config.queue_depth, "priority link started");
        Ok(link)
    }

    /// Two links joined by a Unix socket pair.
    #[cfg(unix)]
    pub fn pair(config: LinkConfig) -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((
            Self::start(left, config.clone())?,
            Self::start(right, config)?,
        ))
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// True once a frame failed to write.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// The priority to queue `message` at, or `None` if the link must refuse it.
    fn accepts(&self, message: &[u8]) -> Option<u8> {
        let priority = *message.first()?;
        if priority == SHUTDOWN_PRIORITY || self.is_draining() || self.has_failed() {
            return None;
        }
        Some(priority)
    }

    /// Flush queued messages, then release the byte stream. Idempotent.
    pub fn stop(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tx_queue.force_push(self.sequencer.shutdown());
        join_unless_current(self.tx_thread.lock().take());

        if let Some(socket) = self.socket.lock().take() {
            if let Err(err) = socket.shutdown_both() {
                trace!(error = %err, "socket shutdown");
            }
        }
        self.rx_queue.close();
        join_unless_current(self.rx_thread.lock().take());
        debug!("priority link stopped");
    }
}

impl Channel for PriorityLink {
    fn recv(&self) -> Option<Envelope> {
        self.rx_queue.pop()
    }

    fn send(&self, message: Bytes) -> bool {
        match self.accepts(&message) {
            Some(priority) => self.tx_queue.push(self.sequencer.stamp(priority, message)),
            None => false,
        }
    }

    fn try_send(&self, message: Bytes) -> bool {
        match self.accepts(&message) {
            Some(priority) => self.tx_queue.offer(self.sequencer.stamp(priority, message)),
            None => false,
        }
    }

    fn close(&self) {
        self.stop();
    }
}

impl Drop for PriorityLink {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PriorityLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityLink")
            .field("rx_pending", &self.rx_queue.len())
            .field("tx_pending", &self.tx_queue.len())
            .field("queue_depth", &self.tx_queue.capacity())
            .field("draining", &self.is_draining())
            .finish()
    }
}

fn run_rx_loop(
    mut reader: FrameReader<Box<dyn Duplex>>,
    queue: &PriorityQueue,
    sequencer: &Sequencer,
) {
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(WireError::ConnectionClosed) => {
                debug!("link closed by peer");
                break;
            }
            Err(err) => {
                debug!(error = %err, "link read failed");
                break;
            }
        };
        let Some(&priority) = frame.first() else {
            warn!("dropping empty frame");
            continue;
        };
        let envelope = sequencer.stamp(priority, frame);
        let queued = if priority == SHUTDOWN_PRIORITY {
            queue.force_push(envelope)
        } else {
            queue.push(envelope)
        };
        if !queued {
            break;
        }
    }
    queue.force_push(sequencer.shutdown());
}

fn run_tx_loop(
    mut writer: FrameWriter<Box<dyn Duplex>>,
    queue: &PriorityQueue,
    failed: &AtomicBool,
) {
    while let Some(envelope) = queue.pop() {
        if envelope.is_shutdown() {
            while let Some(rest) = queue.try_pop() {
                if rest.is_shutdown() {
                    continue;
                }
                if let Err(err) = writer.write_frame(rest.message()) {
                    debug!(error = %err, "link write failed while draining");
                    failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
            break;
        }
        if let Err(err) = writer.write_frame(envelope.message()) {
            debug!(error = %err, "link write failed");
            failed.store(true, Ordering::SeqCst);
            break;
        }
    }
    queue.close();
}

fn join_unless_current(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    use streammux_wire::Message;

    use super::*;

    fn data(priority: u8, stream_id: u8, payload: &'static [u8]) -> Bytes {
        Message::Data {
            priority,
            stream_id,
            payload: Bytes::from_static(payload),
        }
        .to_bytes()
        .unwrap()
    }

    fn recv_within(link: &PriorityLink) -> Envelope {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(envelope) = link.rx_queue.pop_timeout(Duration::from_millis(20)) {
                return envelope;
            }
            assert!(Instant::now() < deadline, "no envelope arrived");
        }
    }

    #[test]
    fn messages_cross_the_link() {
        let (left, right) = PriorityLink::pair(LinkConfig::default()).unwrap();
        assert!(left.send(data(3, 7, b"hello")));

        let envelope = recv_within(&right);
        assert_eq!(envelope.priority(), 3);
        let message = Message::decode(envelope.into_message()).unwrap();
        assert_eq!(
            message,
            Message::Data {
                priority: 3,
                stream_id: 7,
                payload: Bytes::from_static(b"hello"),
            }
        );
    }

    #[test]
    fn receive_side_orders_by_priority() {
        let (left, right) = PriorityLink::pair(LinkConfig::default()).unwrap();
        assert!(left.send(data(9, 1, b"late")));
        assert!(left.send(data(2, 1, b"urgent")));

        let deadline = Instant::now() + Duration::from_secs(2);
        while right.rx_queue.len() < 2 {
            assert!(Instant::now() < deadline, "frames did not arrive");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(right.recv().unwrap().priority(), 2);
        assert_eq!(right.recv().unwrap().priority(), 9);
    }

    #[test]
    fn send_rejects_reserved_priority_and_empty_messages() {
        let (left, _right) = PriorityLink::pair(LinkConfig::default()).unwrap();
        assert!(!left.send(data(0, 1, b"x")));
        assert!(!left.send(Bytes::new()));
    }

    #[test]
    fn send_after_stop_is_rejected() {
        let (left, _right) = PriorityLink::pair(LinkConfig::default()).unwrap();
        left.stop();
        assert!(left.is_draining());
        assert!(!left.send(data(1, 1, b"x")));
        left.stop();
    }

    #[test]
    fn stop_flushes_queued_messages() {
        let (left, right) = UnixStream::pair().unwrap();
        let link = PriorityLink::start(left, LinkConfig::default()).unwrap();
        for _ in 0..50 {
            assert!(link.send(data(5, 2, b"payload")));
        }
        link.stop();

        let mut reader = FrameReader::new(right);
        for _ in 0..50 {
            let message = reader.read_message().unwrap();
            assert_eq!(message.stream_id(), 2);
        }
        assert!(matches!(
            reader.read_frame(),
            Err(WireError::ConnectionClosed)
        ));
    }

    #[test]
    fn peer_eof_yields_shutdown_sentinel() {
        let (left, right) = UnixStream::pair().unwrap();
        let link = PriorityLink::start(left, LinkConfig::default()).unwrap();
        drop(right);

        let envelope = recv_within(&link);
        assert!(envelope.is_shutdown());
    }

    #[test]
    fn oversized_frame_ends_the_link() {
        let config = LinkConfig {
            frame: streammux_wire::FrameConfig {
                max_frame_size: 16,
                ..Default::default()
            },
            ..LinkConfig::default()
        };
        let (left, right) = UnixStream::pair().unwrap();
        let link = PriorityLink::start(left, config).unwrap();

        let mut writer = FrameWriter::new(right);
        writer
            .write_frame(&data(4, 1, b"definitely more than sixteen bytes"))
            .unwrap();
        assert!(recv_within(&link).is_shutdown());
    }

    #[test]
    fn try_send_refuses_when_transmit_queue_is_full() {
        let (left, right) = UnixStream::pair().unwrap();
        let config = LinkConfig {
            queue_depth: 1,
            ..LinkConfig::default()
        };
        let link = PriorityLink::start(left, config).unwrap();
        let bulk = Message::Data {
            priority: 5,
            stream_id: 1,
            payload: Bytes::from(vec![0u8; streammux_wire::MAX_DATA_PAYLOAD]),
        }
        .to_bytes()
        .unwrap();

        // Nobody reads `right`, so the tx thread eventually blocks on the socket.
        let refused = (0..1000).any(|_| !link.try_send(bulk.clone()));
        assert!(refused);
        assert!(!link.has_failed());

        drop(right);
        drop(link);
    }
}
