use crate::error::{Error, Result};
use crate::transport::{Buffer, SocketOperation, Transceiver, TransportInfo};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Largest UDP payload over IPv4 (65535 - 20 byte IP header - 8 byte UDP header).
pub const MAX_DATAGRAM_SIZE: usize = 65507;

#[derive(Debug)]
struct UdpState {
    socket: Option<UdpSocket>,
    /// Sender of the last datagram; replies from an unconnected socket go there.
    peer: Option<SocketAddr>,
}

/// Datagram transceiver over a tokio `UdpSocket`.
///
/// A client socket is connected to its server; a server socket stays
/// unconnected and answers whoever sent the last datagram.
#[derive(Debug)]
pub struct UdpTransceiver {
    state: Mutex<UdpState>,
    connected: bool,
    local: Option<SocketAddr>,
}

impl UdpTransceiver {
    /// Transceiver for a socket already `connect`ed to its peer.
    pub fn connected(socket: UdpSocket) -> Self {
        let local = socket.local_addr().ok();
        let peer = socket.peer_addr().ok();
        Self {
            state: Mutex::new(UdpState {
                socket: Some(socket),
                peer,
            }),
            connected: true,
            local,
        }
    }

    /// Transceiver for a bound, unconnected server socket.
    pub fn bound(socket: UdpSocket) -> Self {
        let local = socket.local_addr().ok();
        Self {
            state: Mutex::new(UdpState {
                socket: Some(socket),
                peer: None,
            }),
            connected: false,
            local,
        }
    }

    fn closed_error(operation: &str) -> Error {
        Error::ConnectionLost {
            reason: format!("{} on closed socket", operation),
        }
    }
}

impl Transceiver for UdpTransceiver {
    fn protocol(&self) -> &'static str {
        "udp"
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn closing(&self, _initiator: bool, _reason: &Error) -> SocketOperation {
        SocketOperation::NONE
    }

    fn close(&self) {
        if self.state.lock().socket.take().is_some() {
            debug!(transport = %self.description(), "Closed udp socket");
        }
    }

    fn write(&self, buf: &mut Buffer) -> Result<SocketOperation> {
        let state = self.state.lock();
        let socket = state
            .socket
            .as_ref()
            .ok_or_else(|| Self::closed_error("write"))?;

        let result = if self.connected {
            socket.try_send(buf.remaining())
        } else {
            let peer = state.peer.ok_or_else(|| Error::Socket {
                kind: io::ErrorKind::NotConnected,
                reason: "no peer address to reply to".to_string(),
            })?;
            socket.try_send_to(buf.remaining(), peer)
        };

        match result {
            Ok(sent) => {
                trace!(sent, "Sent datagram");
                let len = buf.remaining().len();
                buf.advance(len);
                Ok(SocketOperation::NONE)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SocketOperation::WRITE),
            Err(e) => Err(Error::from_io(&e, "send")),
        }
    }

    fn read(&self, buf: &mut Buffer) -> Result<SocketOperation> {
        let mut state = self.state.lock();
        let socket = state
            .socket
            .as_ref()
            .ok_or_else(|| Self::closed_error("read"))?;

        let mut datagram = vec![0u8; MAX_DATAGRAM_SIZE];
        let result = if self.connected {
            socket.try_recv(&mut datagram).map(|n| (n, None))
        } else {
            socket
                .try_recv_from(&mut datagram)
                .map(|(n, from)| (n, Some(from)))
        };

        match result {
            Ok((received, from)) => {
                trace!(received, from = ?from, "Received datagram");
                if from.is_some() {
                    state.peer = from;
                }
                datagram.truncate(received);
                *buf = Buffer::from_vec(datagram);
                buf.advance(received);
                Ok(SocketOperation::NONE)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SocketOperation::READ),
            Err(e) => Err(Error::from_io(&e, "recv")),
        }
    }

    fn poll_ready(
        &self,
        cx: &mut Context<'_>,
        interest: SocketOperation,
    ) -> Poll<io::Result<SocketOperation>> {
        let state = self.state.lock();
        let Some(socket) = state.socket.as_ref() else {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected)));
        };

        let mut ready = SocketOperation::NONE;
        if interest.contains(SocketOperation::READ) {
            if let Poll::Ready(result) = socket.poll_recv_ready(cx) {
                result?;
                ready |= SocketOperation::READ;
            }
        }
        if interest.intersects(SocketOperation::WRITE | SocketOperation::CONNECT) {
            if let Poll::Ready(result) = socket.poll_send_ready(cx) {
                result?;
                ready |= SocketOperation::WRITE;
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(ready))
        }
    }

    fn check_send_size(&self, size: usize) -> Result<()> {
        if size > MAX_DATAGRAM_SIZE {
            return Err(Error::DatagramLimit { size });
        }
        Ok(())
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            local: self.local,
            remote: self.state.lock().peer,
        }
    }
}
