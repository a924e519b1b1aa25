use crate::error::{Error, Result};
use crate::transport::{Buffer, SocketOperation, Transceiver, TransportInfo};
use parking_lot::Mutex;
use std::io;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Stream transceiver over a connected tokio `TcpStream`.
#[derive(Debug)]
pub struct TcpTransceiver {
    stream: Mutex<Option<TcpStream>>,
    info: TransportInfo,
}

impl TcpTransceiver {
    pub fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to disable Nagle's algorithm");
        }
        let info = TransportInfo {
            local: stream.local_addr().ok(),
            remote: stream.peer_addr().ok(),
        };
        Self {
            stream: Mutex::new(Some(stream)),
            info,
        }
    }

    fn closed_error(operation: &str) -> Error {
        Error::ConnectionLost {
            reason: format!("{} on closed socket", operation),
        }
    }
}

impl Transceiver for TcpTransceiver {
    fn protocol(&self) -> &'static str {
        "tcp"
    }

    fn close(&self) {
        if self.stream.lock().take().is_some() {
            debug!(transport = %self.description(), "Closed tcp socket");
        }
    }

    fn write(&self, buf: &mut Buffer) -> Result<SocketOperation> {
        let guard = self.stream.lock();
        let stream = guard.as_ref().ok_or_else(|| Self::closed_error("write"))?;

        while buf.has_remaining() {
            match stream.try_write(buf.remaining()) {
                Ok(0) => {
                    return Err(Error::ConnectionLost {
                        reason: "write returned 0 bytes".to_string(),
                    })
                }
                Ok(written) => {
                    trace!(written, remaining = buf.remaining().len() - written, "Partial write");
                    buf.advance(written);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SocketOperation::WRITE)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(&e, "write")),
            }
        }
        Ok(SocketOperation::NONE)
    }

    fn read(&self, buf: &mut Buffer) -> Result<SocketOperation> {
        let guard = self.stream.lock();
        let stream = guard.as_ref().ok_or_else(|| Self::closed_error("read"))?;

        while buf.has_remaining() {
            match stream.try_read(buf.remaining_mut()) {
                Ok(0) => {
                    return Err(Error::ConnectionLost {
                        reason: "connection closed by peer".to_string(),
                    })
                }
                Ok(read) => {
                    trace!(read, "Partial read");
                    buf.advance(read);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SocketOperation::READ)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(&e, "read")),
            }
        }
        Ok(SocketOperation::NONE)
    }

    fn poll_ready(
        &self,
        cx: &mut Context<'_>,
        interest: SocketOperation,
    ) -> Poll<io::Result<SocketOperation>> {
        let guard = self.stream.lock();
        let Some(stream) = guard.as_ref() else {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected)));
        };

        let mut ready = SocketOperation::NONE;
        if interest.contains(SocketOperation::READ) {
            if let Poll::Ready(result) = stream.poll_read_ready(cx) {
                result?;
                ready |= SocketOperation::READ;
            }
        }
        if interest.intersects(SocketOperation::WRITE | SocketOperation::CONNECT) {
            if let Poll::Ready(result) = stream.poll_write_ready(cx) {
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

    fn info(&self) -> TransportInfo {
        self.info.clone()
    }
}
