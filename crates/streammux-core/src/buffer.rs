//! Flow-controlled transit buffers owned by each stream.
//!
//! [`InputBuffer`] holds bytes the peer sent until the application reads
//! them. Every read reports the freed byte count on a channel so a separate
//! task can grant the peer more window without the reader ever blocking on
//! the wire.
//!
//! [`OutputBuffer`] holds bytes the application wrote until the sender task
//! can move them onto the wire, which it only does while the peer has
//! advertised free capacity.

use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use streammux_wire::MAX_DATA_PAYLOAD;

use crate::error::{MuxError, Result};

pub struct InputBuffer {
    state: Mutex<InputState>,
    readable: Condvar,
    capacity: usize,
    freed: Sender<usize>,
}

struct InputState {
    data: BytesMut,
    finished: bool,
    closed: bool,
}

impl InputBuffer {
    /// Create a buffer and the receiving end of its free-notification queue.
    pub fn new(capacity: usize) -> (Self, Receiver<usize>) {
        let (freed, freed_rx) = crossbeam_channel::unbounded();
        let buffer = Self {
            state: Mutex::new(InputState {
                data: BytesMut::with_capacity(capacity),
                finished: false,
                closed: false,
            }),
            readable: Condvar::new(),
            capacity,
            freed,
        };
        (buffer, freed_rx)
    }

    /// Append bytes received from the peer.
    ///
    /// The peer may never send more than the window it was granted, so a
    /// payload that does not fit is a flow-control violation.
    pub fn write_from_peer(&self, payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.finished {
            return Err(MuxError::Closed);
        }
        let free = self.capacity - state.data.len();
        if payload.len() > free {
            return Err(MuxError::FlowControl {
                received: payload.len(),
                free,
            });
        }
        state.data.extend_from_slice(payload);
        self.readable.notify_all();
        Ok(())
    }

    /// Copy out at least one byte, waiting for data if necessary.
    ///
    /// Returns `Ok(0)` once the peer has finished and everything buffered has
    /// been read, and `Err(Closed)` after a local close.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(MuxError::Closed);
            }
            if !state.data.is_empty() {
                let n = buf.len().min(state.data.len());
                buf[..n].copy_from_slice(&state.data[..n]);
                state.data.advance(n);
                drop(state);
                // The forwarder may already be gone during teardown.
                let _ = self.freed.send(n);
                return Ok(n);
            }
            if state.finished {
                return Ok(0);
            }
            self.readable.wait(&mut state);
        }
    }

    /// The peer will send nothing more; buffered bytes stay readable.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        self.readable.notify_all();
    }

    /// Discard buffered bytes and fail every current and future read.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.data.clear();
        self.readable.notify_all();
    }

    pub fn available(&self) -> usize {
        self.state.lock().data.len()
    }
}

pub struct OutputBuffer {
    state: Mutex<OutputState>,
    /// Signalled when buffer space frees up or a send completes.
    space: Condvar,
    /// Signalled when data arrives or the peer grants more window.
    sendable: Condvar,
    capacity: usize,
}

struct OutputState {
    data: BytesMut,
    remote_available: usize,
    in_flight: usize,
    closed: bool,
}

impl OutputBuffer {
    pub fn new(capacity: usize, window: usize) -> Self {
        Self {
            state: Mutex::new(OutputState {
                data: BytesMut::with_capacity(capacity),
                remote_available: window,
                in_flight: 0,
                closed: false,
            }),
            space: Condvar::new(),
            sendable: Condvar::new(),
            capacity,
        }
    }

    /// Buffer as much of `buf` as fits, waiting while the buffer is full.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(MuxError::Closed);
            }
            let free = self.capacity - state.data.len();
            if free > 0 {
                let n = free.min(buf.len());
                state.data.extend_from_slice(&buf[..n]);
                self.sendable.notify_all();
                return Ok(n);
            }
            self.space.wait(&mut state);
        }
    }

    /// Wait until the peer has room and data is buffered, then take the
    /// next DATA payload and charge it against the window.
    ///
    /// The caller must report the send with [`complete_send`](Self::complete_send).
    pub fn take_for_send(&self) -> Result<Bytes> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(MuxError::Closed);
            }
            if state.remote_available > 0 && !state.data.is_empty() {
                let n = state
                    .remote_available
                    .min(state.data.len())
                    .min(MAX_DATA_PAYLOAD);
                let chunk = state.data.split_to(n).freeze();
                state.remote_available -= n;
                state.in_flight += n;
                self.space.notify_all();
                return Ok(chunk);
            }
            self.sendable.wait(&mut state);
        }
    }

    /// A chunk returned by `take_for_send` has been handed to the channel.
    pub fn complete_send(&self, len: usize) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(len);
        self.space.notify_all();
    }

    /// The peer freed `n` bytes of its input buffer.
    pub fn increase_remote_available(&self, n: usize) {
        let mut state = self.state.lock();
        state.remote_available = state.remote_available.saturating_add(n);
        self.sendable.notify_all();
    }

    /// Wait until everything written has been handed to the channel.
    ///
    /// Returns false if the deadline passes first or the buffer is closed.
    pub fn drain(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return false;
            }
            if state.data.is_empty() && state.in_flight == 0 {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.space.wait_until(&mut state, deadline).timed_out() {
                        return state.data.is_empty() && state.in_flight == 0;
                    }
                }
                None => self.space.wait(&mut state),
            }
        }
    }

    /// Discard buffered bytes and fail every current and future write.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.data.clear();
        self.space.notify_all();
        self.sendable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn remote_available(&self) -> usize {
        self.state.lock().remote_available
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn read_waits_for_peer_data() {
        let (input, freed) = InputBuffer::new(64);
        let input = Arc::new(input);

        let reader = {
            let input = input.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                let n = input.read(&mut buf).unwrap();
                buf[..n].to_vec()
            })
        };
        thread::sleep(Duration::from_millis(20));
        input.write_from_peer(b"hello").unwrap();

        assert_eq!(reader.join().unwrap(), b"hello");
        assert_eq!(freed.try_recv().unwrap(), 5);
    }

    #[test]
    fn freed_counts_sum_to_bytes_read() {
        let (input, freed) = InputBuffer::new(32);
        input.write_from_peer(&[7u8; 30]).unwrap();

        let mut buf = [0u8; 4];
        let mut total = 0;
        while input.available() > 0 {
            total += input.read(&mut buf).unwrap();
        }
        assert_eq!(total, 30);
        assert_eq!(freed.try_iter().sum::<usize>(), 30);
    }

    #[test]
    fn overflow_is_flow_control_violation() {
        let (input, _freed) = InputBuffer::new(8);
        input.write_from_peer(b"12345").unwrap();
        let err = input.write_from_peer(b"6789").unwrap_err();
        assert!(matches!(
            err,
            MuxError::FlowControl {
                received: 4,
                free: 3
            }
        ));
    }

    #[test]
    fn finish_keeps_data_then_reports_eof() {
        let (input, _freed) = InputBuffer::new(8);
        input.write_from_peer(b"end").unwrap();
        input.finish();

        let mut buf = [0u8; 8];
        assert_eq!(input.read(&mut buf).unwrap(), 3);
        assert_eq!(input.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn close_discards_and_wakes_reader() {
        let (input, _freed) = InputBuffer::new(8);
        let input = Arc::new(input);
        let reader = {
            let input = input.clone();
            thread::spawn(move || input.read(&mut [0u8; 4]))
        };
        thread::sleep(Duration::from_millis(20));
        input.close();
        assert!(matches!(reader.join().unwrap(), Err(MuxError::Closed)));
        assert!(matches!(
            input.write_from_peer(b"x"),
            Err(MuxError::Closed)
        ));
    }

    #[test]
    fn sends_are_bounded_by_remote_window() {
        let output = OutputBuffer::new(64, 10);
        assert_eq!(output.write(&[1u8; 25]).unwrap(), 25);

        let chunk = output.take_for_send().unwrap();
        assert_eq!(chunk.len(), 10);
        output.complete_send(chunk.len());
        assert_eq!(output.remote_available(), 0);
        assert_eq!(output.buffered(), 15);

        output.increase_remote_available(4);
        let chunk = output.take_for_send().unwrap();
        assert_eq!(chunk.len(), 4);
        output.complete_send(chunk.len());
    }

    #[test]
    fn sender_waits_for_increment() {
        let output = Arc::new(OutputBuffer::new(16, 0));
        output.write(b"abc").unwrap();

        let sender = {
            let output = output.clone();
            thread::spawn(move || output.take_for_send())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!sender.is_finished());

        output.increase_remote_available(2);
        assert_eq!(sender.join().unwrap().unwrap().as_ref(), b"ab");
    }

    #[test]
    fn write_blocks_while_full() {
        let output = Arc::new(OutputBuffer::new(4, 100));
        assert_eq!(output.write(b"abcdef").unwrap(), 4);

        let writer = {
            let output = output.clone();
            thread::spawn(move || output.write(b"gh"))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!writer.is_finished());

        let chunk = output.take_for_send().unwrap();
        output.complete_send(chunk.len());
        assert_eq!(writer.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn chunks_never_exceed_max_payload() {
        let output = OutputBuffer::new(MAX_DATA_PAYLOAD + 10, usize::MAX / 2);
        let data = vec![0u8; MAX_DATA_PAYLOAD + 10];
        assert_eq!(output.write(&data).unwrap(), data.len());
        assert_eq!(output.take_for_send().unwrap().len(), MAX_DATA_PAYLOAD);
        assert_eq!(output.take_for_send().unwrap().len(), 10);
    }

    #[test]
    fn drain_waits_for_in_flight() {
        let output = Arc::new(OutputBuffer::new(16, 16));
        output.write(b"xyz").unwrap();
        let chunk = output.take_for_send().unwrap();

        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!output.drain(Some(deadline)));

        output.complete_send(chunk.len());
        assert!(output.drain(Some(Instant::now() + Duration::from_millis(20))));
    }

    #[test]
    fn close_fails_blocked_sender_and_writer() {
        let output = Arc::new(OutputBuffer::new(2, 0));
        output.write(b"ab").unwrap();

        let sender = {
            let output = output.clone();
            thread::spawn(move || output.take_for_send())
        };
        let writer = {
            let output = output.clone();
            thread::spawn(move || output.write(b"c"))
        };
        thread::sleep(Duration::from_millis(20));
        output.close();

        assert!(matches!(sender.join().unwrap(), Err(MuxError::Closed)));
        assert!(matches!(writer.join().unwrap(), Err(MuxError::Closed)));
        assert!(!output.drain(None));
    }
}
