//! Non-blocking transports driven by readiness events.
//!
//! A [`Transceiver`] never blocks: `read` and `write` make as much progress as
//! the socket allows and report which readiness they still need. The
//! connection's I/O driver waits for that readiness through
//! [`Transceiver::poll_ready`] and calls back into the connection.

pub mod memory;
pub mod tcp;
pub mod udp;

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

pub use memory::MemoryTransceiver;
pub use tcp::TcpTransceiver;
pub use udp::UdpTransceiver;

bitflags! {
    /// Socket readiness a transceiver is waiting for (or that is available).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SocketOperation: u8 {
        const READ = 0b0001;
        const CONNECT = 0b0010;
        const WRITE = 0b0100;
    }
}

impl SocketOperation {
    pub const NONE: SocketOperation = SocketOperation::empty();
}

/// Byte buffer with a cursor. Reads fill `data[pos..]`, writes drain it.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer of `len` zeroed bytes positioned at the start, ready for reading.
    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![0; len],
            pos: 0,
        }
    }

    /// Buffer wrapping outgoing bytes, positioned at the start.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        debug_assert!(pos <= self.data.len());
        self.pos = pos;
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn remaining_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..]
    }

    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    /// Resize keeping existing bytes, zero-filling any extension.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
        if self.pos > len {
            self.pos = len;
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn take(&mut self) -> Vec<u8> {
        self.pos = 0;
        std::mem::take(&mut self.data)
    }
}

/// Addresses and description of an established transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportInfo {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

/// A non-blocking, readiness-driven transport endpoint.
pub trait Transceiver: Send + Sync + fmt::Debug {
    /// Transport name, e.g. `tcp`.
    fn protocol(&self) -> &'static str;

    /// Datagram transports skip validation and graceful close negotiation.
    fn is_datagram(&self) -> bool {
        false
    }

    /// Complete any transport-level handshake. Returns the readiness still
    /// required, or `NONE` when the transport is established.
    fn initialize(&self, _read: &mut Buffer, _write: &mut Buffer) -> Result<SocketOperation> {
        Ok(SocketOperation::NONE)
    }

    /// Notify the transport that the connection is being closed gracefully.
    /// Returns the readiness to wait for before the close completes.
    fn closing(&self, initiator: bool, _reason: &Error) -> SocketOperation {
        // The initiator waits for the peer to close its side.
        if initiator {
            SocketOperation::READ
        } else {
            SocketOperation::NONE
        }
    }

    /// Release the underlying socket.
    fn close(&self);

    /// Write from `buf.pos()` on. Returns `WRITE` if the socket would block
    /// before the buffer was drained.
    fn write(&self, buf: &mut Buffer) -> Result<SocketOperation>;

    /// Read into `buf.pos()..`. Returns `READ` if the socket would block
    /// before the buffer was filled.
    ///
    /// Datagram transports instead replace the buffer with one whole
    /// datagram, positioned at its end.
    fn read(&self, buf: &mut Buffer) -> Result<SocketOperation>;

    /// Wait for any of the readiness in `interest`.
    fn poll_ready(
        &self,
        cx: &mut Context<'_>,
        interest: SocketOperation,
    ) -> Poll<io::Result<SocketOperation>>;

    /// Reject frames the transport cannot carry.
    fn check_send_size(&self, _size: usize) -> Result<()> {
        Ok(())
    }

    fn info(&self) -> TransportInfo {
        TransportInfo::default()
    }

    fn description(&self) -> String {
        let info = self.info();
        match (info.local, info.remote) {
            (Some(local), Some(remote)) => {
                format!("{} local = {}, remote = {}", self.protocol(), local, remote)
            }
            (Some(local), None) => format!("{} local = {}", self.protocol(), local),
            _ => self.protocol().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_cursor() {
        let mut buf = Buffer::with_len(4);
        assert!(buf.has_remaining());
        buf.remaining_mut()[..2].copy_from_slice(&[1, 2]);
        buf.advance(2);
        assert_eq!(buf.pos(), 2);
        buf.resize(6);
        assert_eq!(buf.len(), 6);
        assert_eq!(&buf.as_slice()[..2], &[1, 2]);
        buf.resize(1);
        assert_eq!(buf.pos(), 1);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_socket_operation_flags() {
        let ops = SocketOperation::READ | SocketOperation::WRITE;
        assert!(ops.contains(SocketOperation::READ));
        assert!((ops - SocketOperation::READ) == SocketOperation::WRITE);
        assert!(SocketOperation::NONE.is_empty());
    }
}
