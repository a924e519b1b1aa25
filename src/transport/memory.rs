//! In-process transceiver pair.
//!
//! Two [`MemoryTransceiver`]s created by [`MemoryTransceiver::pair`] behave
//! like the ends of a connected socket: bytes written on one end become
//! readable on the other, writes block once the peer's inbound capacity is
//! used up, and closing one end surfaces as a lost connection on the other.
//! The datagram flavour preserves message boundaries instead.

use crate::error::{Error, Result};
use crate::transport::{Buffer, SocketOperation, Transceiver};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::trace;

/// Default capacity of each direction, in bytes.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct Pipe {
    bytes: VecDeque<u8>,
    datagrams: VecDeque<Vec<u8>>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Pipe {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    fn readable(&self) -> bool {
        !self.bytes.is_empty() || !self.datagrams.is_empty() || self.writer_closed
    }

    fn writable(&self) -> bool {
        self.reader_closed || self.bytes.len() < self.capacity
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// One end of an in-memory connection.
pub struct MemoryTransceiver {
    name: String,
    datagram: bool,
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
}

impl fmt::Debug for MemoryTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransceiver")
            .field("name", &self.name)
            .field("datagram", &self.datagram)
            .finish()
    }
}

impl MemoryTransceiver {
    /// Connected stream pair with the default capacity.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Connected stream pair whose directions each buffer at most
    /// `capacity` bytes before writes would block.
    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        Self::build(capacity.max(1), false)
    }

    /// Connected pair preserving message boundaries.
    pub fn datagram_pair() -> (Self, Self) {
        Self::build(usize::MAX, true)
    }

    fn build(capacity: usize, datagram: bool) -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(Pipe::with_capacity(capacity)));
        let b_to_a = Arc::new(Mutex::new(Pipe::with_capacity(capacity)));
        let a = Self {
            name: "memory-a".to_string(),
            datagram,
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
        };
        let b = Self {
            name: "memory-b".to_string(),
            datagram,
            inbound: a_to_b,
            outbound: b_to_a,
        };
        (a, b)
    }

    /// Push bytes to the peer regardless of capacity. Used to inject raw
    /// frames from a test harness acting as the peer.
    pub fn send_raw(&self, bytes: &[u8]) {
        let mut pipe = self.outbound.lock();
        if self.datagram {
            pipe.datagrams.push_back(bytes.to_vec());
        } else {
            pipe.bytes.extend(bytes.iter().copied());
        }
        pipe.wake_reader();
    }

    /// Drain everything the peer has written so far.
    pub fn recv_available(&self) -> Vec<Vec<u8>> {
        let mut pipe = self.inbound.lock();
        let out = if self.datagram {
            pipe.datagrams.drain(..).collect()
        } else if pipe.bytes.is_empty() {
            Vec::new()
        } else {
            vec![pipe.bytes.drain(..).collect()]
        };
        pipe.wake_writer();
        out
    }

    /// True once the peer has closed its end.
    pub fn is_peer_closed(&self) -> bool {
        self.inbound.lock().writer_closed
    }
}

impl Transceiver for MemoryTransceiver {
    fn protocol(&self) -> &'static str {
        "memory"
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }

    fn close(&self) {
        {
            let mut out = self.outbound.lock();
            out.writer_closed = true;
            out.wake_reader();
            out.wake_writer();
        }
        let mut inbound = self.inbound.lock();
        inbound.reader_closed = true;
        inbound.wake_reader();
        inbound.wake_writer();
        trace!(name = %self.name, "Closed memory transceiver");
    }

    fn write(&self, buf: &mut Buffer) -> Result<SocketOperation> {
        let mut pipe = self.outbound.lock();
        if pipe.reader_closed || pipe.writer_closed {
            return Err(Error::ConnectionLost {
                reason: "peer closed the memory pipe".to_string(),
            });
        }

        if self.datagram {
            pipe.datagrams.push_back(buf.remaining().to_vec());
            let len = buf.remaining().len();
            buf.advance(len);
            pipe.wake_reader();
            return Ok(SocketOperation::NONE);
        }

        let room = pipe.capacity.saturating_sub(pipe.bytes.len());
        let n = room.min(buf.remaining().len());
        if n > 0 {
            pipe.bytes.extend(buf.remaining()[..n].iter().copied());
            buf.advance(n);
            pipe.wake_reader();
        }
        if buf.has_remaining() {
            Ok(SocketOperation::WRITE)
        } else {
            Ok(SocketOperation::NONE)
        }
    }

    fn read(&self, buf: &mut Buffer) -> Result<SocketOperation> {
        let mut pipe = self.inbound.lock();

        if self.datagram {
            return match pipe.datagrams.pop_front() {
                Some(datagram) => {
                    let len = datagram.len();
                    *buf = Buffer::from_vec(datagram);
                    buf.advance(len);
                    Ok(SocketOperation::NONE)
                }
                None if pipe.writer_closed => Err(Error::ConnectionLost {
                    reason: "peer closed the memory pipe".to_string(),
                }),
                None => Ok(SocketOperation::READ),
            };
        }

        while buf.has_remaining() {
            match pipe.bytes.pop_front() {
                Some(byte) => {
                    buf.remaining_mut()[0] = byte;
                    buf.advance(1);
                }
                None => break,
            }
        }
        pipe.wake_writer();

        if !buf.has_remaining() {
            Ok(SocketOperation::NONE)
        } else if pipe.writer_closed {
            Err(Error::ConnectionLost {
                reason: "connection closed by peer".to_string(),
            })
        } else {
            Ok(SocketOperation::READ)
        }
    }

    fn poll_ready(
        &self,
        cx: &mut Context<'_>,
        interest: SocketOperation,
    ) -> Poll<io::Result<SocketOperation>> {
        let mut ready = SocketOperation::NONE;
        if interest.contains(SocketOperation::READ) {
            let mut pipe = self.inbound.lock();
            if pipe.reader_closed {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected)));
            }
            if pipe.readable() {
                ready |= SocketOperation::READ;
            } else {
                pipe.read_waker = Some(cx.waker().clone());
            }
        }
        if interest.intersects(SocketOperation::WRITE | SocketOperation::CONNECT) {
            let mut pipe = self.outbound.lock();
            if pipe.writable() || pipe.writer_closed {
                ready |= SocketOperation::WRITE;
            } else {
                pipe.write_waker = Some(cx.waker().clone());
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(ready))
        }
    }

    fn description(&self) -> String {
        format!("memory {}", self.name)
    }
}
