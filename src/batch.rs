//! Accumulates one-way batch requests into a single request-batch frame.

use crate::error::{Error, Result};
use crate::outgoing::{InvocationFuture, OutgoingAsync, Outcome};
use crate::protocol::header::{encode_header, CompressionStatus, MessageType, HEADER_SIZE};
use crate::protocol::message::{batch_request_entry, RequestHeader};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Header plus the 4-byte request count.
const BATCH_PREFIX_SIZE: usize = HEADER_SIZE + 4;

/// IP and UDP header overhead subtracted from the datagram size limit.
const UDP_OVERHEAD: usize = 20 + 8;

/// A request offered to a [`BatchRequestInterceptor`].
#[derive(Debug)]
pub struct BatchRequest<'a> {
    pub header: &'a RequestHeader,
    /// Marshaled size of this request inside the batch.
    pub size: usize,
}

/// Policy hook consulted before each request is added to a batch.
///
/// Interceptors run with the queue locked and must not re-enter it.
pub trait BatchRequestInterceptor: Send + Sync {
    /// Return `false` to drop the request.
    fn enqueue(&self, request: &BatchRequest<'_>, queued_count: usize, queued_size: usize) -> bool;
}

/// A batch taken out of the queue, ready to be sent.
#[derive(Debug)]
pub struct BatchFrame {
    /// Request-batch frame. The count and size fields are filled in when
    /// the frame is sent.
    pub frame: Vec<u8>,
    pub count: usize,
    pub compress: bool,
    /// One record per queued request, completed with the frame's result.
    pub callers: Vec<Arc<OutgoingAsync>>,
}

struct BatchInner {
    stream: Vec<u8>,
    count: usize,
    compress: bool,
    callers: Vec<Arc<OutgoingAsync>>,
    error: Option<Error>,
}

impl BatchInner {
    fn reset(&mut self) {
        self.stream.clear();
        self.stream
            .extend_from_slice(&encode_header(MessageType::RequestBatch, 0, CompressionStatus::None));
        self.stream.extend_from_slice(&0i32.to_be_bytes());
        self.count = 0;
        self.compress = false;
        self.callers.clear();
    }

    fn take(&mut self) -> Option<BatchFrame> {
        if self.count == 0 {
            return None;
        }
        let frame = BatchFrame {
            frame: std::mem::take(&mut self.stream),
            count: self.count,
            compress: self.compress,
            callers: std::mem::take(&mut self.callers),
        };
        self.reset();
        Some(frame)
    }
}

pub struct BatchRequestQueue {
    inner: Mutex<BatchInner>,
    interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    max_size: usize,
}

impl fmt::Debug for BatchRequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BatchRequestQueue")
            .field("count", &inner.count)
            .field("size", &inner.stream.len())
            .field("max_size", &self.max_size)
            .field("destroyed", &inner.error.is_some())
            .finish()
    }
}

impl BatchRequestQueue {
    /// `auto_flush_size` of zero disables auto-flush. Datagram queues never
    /// grow beyond what fits in one datagram.
    pub fn new(
        auto_flush_size: usize,
        datagram: bool,
        interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    ) -> Self {
        let mut max_size = auto_flush_size;
        if max_size > 0 && datagram {
            max_size = max_size.min(65535 - UDP_OVERHEAD);
        }
        let mut inner = BatchInner {
            stream: Vec::new(),
            count: 0,
            compress: false,
            callers: Vec::new(),
            error: None,
        };
        inner.reset();
        Self {
            inner: Mutex::new(inner),
            interceptor,
            max_size,
        }
    }

    /// Add a request to the batch. The returned future resolves once the
    /// batch carrying the request is written, or fails with the connection's
    /// error if the queue is destroyed first.
    ///
    /// When adding the request would reach the auto-flush size, the requests
    /// queued so far are taken out and returned; the caller must send them.
    /// The new request always starts or joins the remaining batch.
    pub fn enqueue(
        &self,
        header: &RequestHeader,
        params: &[u8],
        compress: bool,
    ) -> Result<(InvocationFuture, Option<BatchFrame>)> {
        let entry = batch_request_entry(header, params);
        let mut inner = self.inner.lock();
        if let Some(error) = &inner.error {
            return Err(error.clone());
        }

        let mut flushed = None;
        if self.max_size > 0 && inner.count > 0 && inner.stream.len() + entry.len() >= self.max_size {
            debug!(
                queued = inner.count,
                size = inner.stream.len(),
                max_size = self.max_size,
                "Auto-flushing batch"
            );
            flushed = inner.take();
        }

        if let Some(interceptor) = &self.interceptor {
            let request = BatchRequest {
                header,
                size: entry.len(),
            };
            let queued_size = inner.stream.len() - BATCH_PREFIX_SIZE;
            if !interceptor.enqueue(&request, inner.count, queued_size) {
                trace!(operation = %header.operation, "Batch request dropped by interceptor");
                let (out, future) = OutgoingAsync::new(false);
                out.complete(Ok(Outcome::Sent));
                return Ok((future, flushed));
            }
        }

        let (out, future) = OutgoingAsync::new(false);
        inner.stream.extend_from_slice(&entry);
        inner.count += 1;
        inner.compress |= compress;
        inner.callers.push(out);
        trace!(operation = %header.operation, count = inner.count, "Queued batch request");
        Ok((future, flushed))
    }

    /// Take every queued request out as one frame.
    pub fn swap(&self) -> Option<BatchFrame> {
        self.inner.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().count == 0
    }

    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    /// Make the queue permanently unusable. Every queued request fails with
    /// `error`; the number failed is returned.
    pub fn destroy(&self, error: Error) -> usize {
        let callers = {
            let mut inner = self.inner.lock();
            let callers = std::mem::take(&mut inner.callers);
            inner.reset();
            if inner.error.is_none() {
                inner.error = Some(error.clone());
            }
            callers
        };
        for caller in &callers {
            caller.complete(Err(error.clone()));
        }
        callers.len()
    }
}
