//! Pending outgoing operations and queued frames.

use crate::error::{Error, Result};
use crate::protocol::message::Reply;
use crate::transport::Buffer;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// How an invocation completed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A one-way request or batch was fully written.
    Sent,
    /// A two-way request got its reply.
    Reply(Reply),
}

type SentCallback = Box<dyn FnOnce() + Send>;

/// The caller-side record of one invocation.
///
/// Completion is delivered through a oneshot channel; [`OutgoingAsync::complete`]
/// takes the sender, so whichever of reply, cancellation or connection
/// failure gets there first wins and the rest are no-ops.
pub struct OutgoingAsync {
    response: bool,
    request_id: AtomicI32,
    sent: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<Result<Outcome>>>>,
    sent_callback: Mutex<Option<SentCallback>>,
    /// Batch entries carried by this frame; they share its result.
    batched: Mutex<Vec<Arc<OutgoingAsync>>>,
}

impl fmt::Debug for OutgoingAsync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingAsync")
            .field("response", &self.response)
            .field("request_id", &self.request_id())
            .field("sent", &self.is_sent())
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl OutgoingAsync {
    /// Create a record and the future its completion resolves.
    pub fn new(response: bool) -> (Arc<Self>, InvocationFuture) {
        let (tx, rx) = oneshot::channel();
        let out = Arc::new(Self {
            response,
            request_id: AtomicI32::new(0),
            sent: AtomicBool::new(false),
            completion: Mutex::new(Some(tx)),
            sent_callback: Mutex::new(None),
            batched: Mutex::new(Vec::new()),
        });
        (out, InvocationFuture { rx })
    }

    /// Run `callback` once the request bytes are fully written.
    pub fn on_sent(&self, callback: impl FnOnce() + Send + 'static) {
        *self.sent_callback.lock() = Some(Box::new(callback));
    }

    pub fn response(&self) -> bool {
        self.response
    }

    pub fn request_id(&self) -> i32 {
        self.request_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_request_id(&self, id: i32) {
        self.request_id.store(id, Ordering::Release);
    }

    /// Whether any byte of the request may have reached the peer.
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Record that the request was written. Returns whether sent callbacks
    /// need to run.
    pub(crate) fn mark_sent(&self) -> bool {
        self.sent.store(true, Ordering::Release);
        !self.response || self.sent_callback.lock().is_some()
    }

    /// Run the sent callback and, for one-way requests, complete the
    /// invocation. Must be called without the connection lock held.
    pub(crate) fn invoke_sent(&self) {
        if let Some(callback) = self.sent_callback.lock().take() {
            callback();
        }
        if !self.response {
            self.complete(Ok(Outcome::Sent));
        }
    }

    /// Complete `entries` with whatever result this invocation gets.
    pub(crate) fn carry(&self, entries: Vec<Arc<OutgoingAsync>>) {
        self.batched.lock().extend(entries);
    }

    /// Deliver the final result. Returns `false` if the invocation had
    /// already completed.
    pub fn complete(&self, result: Result<Outcome>) -> bool {
        let Some(tx) = self.completion.lock().take() else {
            return false;
        };
        let batched = std::mem::take(&mut *self.batched.lock());
        for entry in batched {
            if result.is_ok() {
                entry.sent.store(true, Ordering::Release);
            }
            entry.complete(result.clone());
        }
        // The caller may have dropped the future; that's fine.
        let _ = tx.send(result);
        true
    }
}

/// Resolves when the invocation completes.
#[derive(Debug)]
pub struct InvocationFuture {
    rx: oneshot::Receiver<Result<Outcome>>,
}

impl InvocationFuture {
    /// Block the calling thread until completion. Must not be called from
    /// within an async context.
    pub fn wait(self) -> Result<Outcome> {
        self.rx.blocking_recv().unwrap_or(Err(Error::InvocationCanceled))
    }
}

impl Future for InvocationFuture {
    type Output = Result<Outcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::InvocationCanceled)))
    }
}

/// A frame waiting in the connection's send queue.
///
/// The message owns its bytes from the moment it is created, so a retry of
/// the same invocation always marshals a fresh frame.
pub struct OutgoingMessage {
    pub(crate) buffer: Buffer,
    pub(crate) compress: bool,
    pub(crate) request_id: i32,
    pub(crate) out: Option<Arc<OutgoingAsync>>,
    /// Compression and size patching already applied.
    pub(crate) prepared: bool,
    /// The request was canceled while being written; its completion has
    /// already been delivered.
    pub(crate) canceled: bool,
}

impl fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("len", &self.buffer.len())
            .field("pos", &self.buffer.pos())
            .field("request_id", &self.request_id)
            .field("prepared", &self.prepared)
            .finish()
    }
}

impl OutgoingMessage {
    /// A frame with no caller to notify (replies and control frames).
    pub fn control(frame: Vec<u8>, compress: bool) -> Self {
        Self {
            buffer: Buffer::from_vec(frame),
            compress,
            request_id: 0,
            out: None,
            prepared: false,
            canceled: false,
        }
    }

    pub fn request(frame: Vec<u8>, compress: bool, request_id: i32, out: Arc<OutgoingAsync>) -> Self {
        Self {
            buffer: Buffer::from_vec(frame),
            compress,
            request_id,
            out: Some(out),
            prepared: false,
            canceled: false,
        }
    }

    /// Called once the frame is fully written. Returns the record whose
    /// sent callbacks must run outside the lock.
    pub(crate) fn sent(&mut self) -> Option<Arc<OutgoingAsync>> {
        if self.canceled {
            return None;
        }
        let out = self.out.as_ref()?;
        if out.mark_sent() {
            Some(out.clone())
        } else {
            None
        }
    }

    /// Fail the originator, unless it was already notified.
    pub(crate) fn completed(&mut self, error: &Error) {
        if let Some(out) = self.out.take() {
            // Part of the frame may already be at the peer.
            if self.buffer.pos() > 0 {
                out.sent.store(true, Ordering::Release);
            }
            if !self.canceled {
                out.complete(Err(error.clone()));
            }
        }
    }

    pub(crate) fn is_for(&self, out: &Arc<OutgoingAsync>) -> bool {
        self.out.as_ref().is_some_and(|o| Arc::ptr_eq(o, out))
    }
}
