//! The connection state machine.
//!
//! A [`Connection`] owns one transceiver and multiplexes two-way requests,
//! one-way requests, batches and replies over it. All mutable state lives
//! behind a single lock; user code (dispatchers, completion and sent
//! callbacks, observer hooks) always runs after the lock is released.
//!
//! Transport readiness is delivered by a driver task spawned per connection
//! (see [`driver`]), which calls back into [`Connection::message`].

mod driver;
mod io;
pub mod state;

pub use state::State;

use crate::acm::{AcmClose, AcmConfig, AcmHeartbeat, AcmSnapshot, CloseAction, ConnectionMonitor};
use crate::batch::BatchRequestQueue;
use crate::correlator::RequestCorrelator;
use crate::dispatch::Adapter;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::network::Endpoint;
use crate::outgoing::{InvocationFuture, OutgoingAsync, OutgoingMessage, Outcome};
use crate::protocol::header::{control_frame, MessageType, HEADER_SIZE};
use crate::protocol::message::{RequestHeader, REQUEST_ID_OFFSET};
use crate::timer::TimerTask;
use crate::transport::{Buffer, SocketOperation, Transceiver};
use driver::Registration;
use io::SendStatus;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Completion of [`Connection::start`].
pub type StartCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Notifications about a connection's peer and lifetime.
pub trait ConnectionCallback: Send + Sync {
    /// The peer sent a heartbeat.
    fn heartbeat(&self, _connection: &Arc<Connection>) {}

    /// The connection closed, for whatever reason.
    fn closed(&self, _connection: &Arc<Connection>) {}
}

/// Why a connection is being shut down from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    AdapterDeactivated,
    RuntimeDestroyed,
}

/// Static details about an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub incoming: bool,
    pub adapter_name: Option<String>,
    pub protocol: &'static str,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub description: String,
}

struct ScheduledTimeout {
    task: TimerTask,
    seq: u64,
}

/// Observer notification recorded under the lock.
enum Observed {
    StateChanged(State, State),
    SentBytes(usize),
    ReceivedBytes(usize),
    Failed(Error),
}

pub(crate) struct Inner {
    state: State,
    exception: Option<Error>,
    initialized: bool,
    validated: bool,
    shutdown_initiated: bool,
    adapter: Option<Adapter>,
    /// Released once the connection is reaped.
    monitor: Option<Arc<ConnectionMonitor>>,
    acm: AcmConfig,
    last_activity: Option<Instant>,
    dispatch_count: usize,
    send_queue: VecDeque<OutgoingMessage>,
    requests: RequestCorrelator<Arc<OutgoingAsync>>,
    read_buf: Buffer,
    read_header: bool,
    write_buf: Buffer,
    start_callback: Option<StartCallback>,
    callback: Option<Arc<dyn ConnectionCallback>>,
    read_timeout: Option<ScheduledTimeout>,
    write_timeout: Option<ScheduledTimeout>,
    timeout_seq: u64,
    observed: Vec<Observed>,
    delivering: bool,
}

/// The held connection lock.
///
/// Observer notifications recorded while it is held are delivered, in
/// order, after it is released.
pub(crate) struct Locked<'a> {
    connection: &'a Connection,
    guard: MutexGuard<'a, Inner>,
}

impl Deref for Locked<'_> {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.guard
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut Inner {
        &mut self.guard
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        // A re-entrant or concurrent holder leaves its events to the one
        // already delivering.
        if self.guard.delivering || self.guard.observed.is_empty() {
            return;
        }
        self.guard.delivering = true;
        while !self.guard.observed.is_empty() {
            let events = std::mem::take(&mut self.guard.observed);
            let connection = self.connection;
            MutexGuard::unlocked(&mut self.guard, || connection.deliver(events));
        }
        self.guard.delivering = false;
    }
}

pub struct Connection {
    id: u64,
    instance: Arc<Instance>,
    transceiver: Arc<dyn Transceiver>,
    endpoint: Endpoint,
    incoming: bool,
    datagram: bool,
    desc: String,
    batch: BatchRequestQueue,
    registration: Registration,
    inner: Mutex<Inner>,
    cond: Condvar,
    state_changed: Notify,
    this: Weak<Connection>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("description", &self.desc)
            .field("incoming", &self.incoming)
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.desc)
    }
}

impl Connection {
    /// Wrap an established transceiver. The connection does nothing until
    /// [`Connection::start`] is called.
    ///
    /// Must be called from within the instance's runtime context or with a
    /// timer bound to a running runtime; the I/O driver is spawned here.
    pub fn new(
        instance: Arc<Instance>,
        transceiver: Arc<dyn Transceiver>,
        endpoint: Endpoint,
        incoming: bool,
        monitor: Option<Arc<ConnectionMonitor>>,
        adapter: Option<Adapter>,
    ) -> Arc<Self> {
        let datagram = transceiver.is_datagram();
        let acm = monitor
            .as_ref()
            .map(|m| m.config())
            .unwrap_or_else(AcmConfig::disabled);
        let last_activity = acm.is_enabled().then(Instant::now);
        let batch = BatchRequestQueue::new(
            instance.batch_auto_flush_size(),
            datagram,
            instance.batch_interceptor(),
        );
        let desc = transceiver.description();

        let connection = Arc::new_cyclic(|this| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            instance: instance.clone(),
            transceiver,
            endpoint,
            incoming,
            datagram,
            desc,
            batch,
            registration: Registration::default(),
            inner: Mutex::new(Inner {
                state: State::NotInitialized,
                exception: None,
                initialized: false,
                validated: false,
                shutdown_initiated: false,
                adapter,
                monitor,
                acm,
                last_activity,
                dispatch_count: 0,
                send_queue: VecDeque::new(),
                requests: RequestCorrelator::new(),
                read_buf: Buffer::with_len(HEADER_SIZE),
                read_header: true,
                write_buf: Buffer::new(),
                start_callback: None,
                callback: None,
                read_timeout: None,
                write_timeout: None,
                timeout_seq: 0,
                observed: Vec::new(),
                delivering: false,
            }),
            cond: Condvar::new(),
            state_changed: Notify::new(),
            this: this.clone(),
        });

        debug!(
            connection = %connection.desc,
            id = connection.id,
            incoming,
            datagram,
            "Created connection"
        );
        instance.timer().spawn(driver::run(connection.clone()));
        connection
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> Locked<'_> {
        Locked {
            connection: self,
            guard: self.inner.lock(),
        }
    }

    pub fn description(&self) -> &str {
        &self.desc
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Transport name, e.g. `tcp`.
    pub fn type_name(&self) -> &'static str {
        self.transceiver.protocol()
    }

    /// Endpoint timeout applied to reads and writes.
    pub fn timeout(&self) -> Option<Duration> {
        self.endpoint.timeout
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    pub fn info(&self) -> ConnectionInfo {
        let transport = self.transceiver.info();
        ConnectionInfo {
            incoming: self.incoming,
            adapter_name: self.lock().adapter.as_ref().map(|a| a.name().to_string()),
            protocol: self.transceiver.protocol(),
            local: transport.local,
            remote: transport.remote,
            description: self.desc.clone(),
        }
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn adapter(&self) -> Option<Adapter> {
        self.lock().adapter.clone()
    }

    /// Two-way requests still waiting for a reply.
    pub fn outstanding_requests(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn batch_request_queue(&self) -> &BatchRequestQueue {
        &self.batch
    }

    pub(crate) fn transceiver(&self) -> &Arc<dyn Transceiver> {
        &self.transceiver
    }

    pub(crate) fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Run the transport and protocol handshakes. `callback` is invoked once
    /// the connection reaches `Holding` or fails.
    pub fn start(&self, callback: StartCallback) {
        self.start_inner(Some(callback));
    }

    fn start_inner(&self, callback: Option<StartCallback>) {
        let result = {
            let mut inner = self.lock();
            if inner.state >= State::Closed {
                Err(self.terminal_exception(&inner))
            } else {
                match self.handshake(&mut inner, SocketOperation::NONE) {
                    Ok(true) => {
                        self.set_state(&mut inner, State::Holding);
                        Ok(())
                    }
                    Ok(false) => {
                        inner.start_callback = callback;
                        return;
                    }
                    Err(e) => {
                        self.set_state_with(&mut inner, State::Closed, e);
                        Err(self.terminal_exception(&inner))
                    }
                }
            }
        };
        if let Some(callback) = callback {
            callback(result);
        }
    }

    /// Start and block the calling thread until the handshake resolves.
    /// Must not be called from an async context.
    pub fn start_and_wait(&self) -> Result<()> {
        self.start_inner(None);
        let mut inner = self.lock();
        while inner.state <= State::NotValidated {
            self.cond.wait(&mut inner.guard);
        }
        if inner.state >= State::Closing {
            return Err(self.terminal_exception(&inner));
        }
        Ok(())
    }

    /// Start and wait for the handshake without blocking the runtime.
    #[instrument(level = "debug", skip(self), fields(connection = %self.desc))]
    pub async fn start_async(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.start(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        rx.await.unwrap_or(Err(Error::ConnectionLost {
            reason: "connection start abandoned".to_string(),
        }))
    }

    /// Resume reading requests.
    pub fn activate(&self) {
        let mut inner = self.lock();
        if inner.state <= State::NotValidated {
            return;
        }
        self.set_state(&mut inner, State::Active);
    }

    /// Stop reading new messages. In-flight work continues.
    pub fn hold(&self) {
        let mut inner = self.lock();
        if inner.state <= State::NotValidated {
            return;
        }
        self.set_state(&mut inner, State::Holding);
    }

    /// Begin a graceful shutdown initiated by the local runtime.
    pub fn destroy(&self, reason: DestroyReason) {
        let mut inner = self.lock();
        let error = match reason {
            DestroyReason::AdapterDeactivated => Error::AdapterDeactivated {
                name: inner
                    .adapter
                    .as_ref()
                    .map(|a| a.name().to_string())
                    .unwrap_or_default(),
            },
            DestroyReason::RuntimeDestroyed => Error::RuntimeDestroyed,
        };
        self.set_state_with(&mut inner, State::Closing, error);
    }

    /// Close the connection.
    ///
    /// Forceful close fails every outstanding request immediately. Graceful
    /// close blocks the calling thread until outstanding two-way requests
    /// are answered, then negotiates the shutdown with the peer.
    pub fn close(&self, force: bool) {
        let mut inner = self.lock();
        if force {
            self.set_state_with(&mut inner, State::Closed, Error::ForcedClose);
        } else {
            while !inner.requests.is_empty() {
                self.cond.wait(&mut inner.guard);
            }
            self.set_state_with(&mut inner, State::Closing, Error::CloseConnection);
        }
    }

    /// [`Connection::close`] for async callers.
    #[instrument(level = "debug", skip(self), fields(connection = %self.desc))]
    pub async fn close_async(&self, force: bool) {
        if force {
            self.close(true);
            return;
        }
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.requests.is_empty() {
                    self.set_state_with(&mut inner, State::Closing, Error::CloseConnection);
                    return;
                }
            }
            notified.await;
        }
    }

    /// Send a request frame built by [`crate::protocol::message::request_frame`]
    /// or a batch frame.
    ///
    /// Fails with [`Error::Retry`] if the connection already failed: nothing
    /// was written, so the request may go to another connection.
    #[instrument(level = "trace", skip_all, fields(connection = %self.desc, size = frame.len(), batch_count))]
    pub fn send_request(
        &self,
        out: &Arc<OutgoingAsync>,
        mut frame: Vec<u8>,
        compress: bool,
        batch_count: usize,
    ) -> Result<()> {
        let notify = {
            let mut inner = self.lock();
            if let Some(exception) = &inner.exception {
                return Err(Error::Retry(Box::new(exception.clone())));
            }
            debug_assert!(inner.state > State::NotValidated && inner.state < State::Closing);

            if frame.len() < REQUEST_ID_OFFSET + 4 {
                return Err(Error::IllegalMessageSize {
                    size: frame.len() as i64,
                });
            }
            self.transceiver.check_send_size(frame.len())?;

            let mut request_id = 0;
            if out.response() {
                request_id = inner.requests.next_request_id();
                frame[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 4]
                    .copy_from_slice(&request_id.to_be_bytes());
            } else if batch_count > 0 {
                frame[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 4]
                    .copy_from_slice(&(batch_count as i32).to_be_bytes());
            }
            out.set_request_id(request_id);

            let message = OutgoingMessage::request(frame, compress, request_id, out.clone());
            let notify = match self.send_message(&mut inner, message) {
                Ok(SendStatus::Sent(notify)) => notify,
                Ok(SendStatus::Queued) => None,
                Err(e) => {
                    self.set_state_with(&mut inner, State::Closed, e);
                    return Err(self.terminal_exception(&inner));
                }
            };
            if out.response() {
                trace!(request_id, "Sent two-way request");
                inner.requests.register(request_id, out.clone());
            }
            notify
        };
        if let Some(out) = notify {
            out.invoke_sent();
        }
        Ok(())
    }

    /// Queue a one-way request in this connection's batch. Requests pushed
    /// out by auto-flush are sent right away.
    ///
    /// The returned future resolves once the batch carrying the request is
    /// written, or with the connection's error if it closes first.
    pub fn queue_batch_request(
        &self,
        header: &RequestHeader,
        params: &[u8],
        compress: bool,
    ) -> Result<InvocationFuture> {
        let (queued, flushed) = self.batch.enqueue(header, params, compress)?;
        if let Some(flushed) = flushed {
            let (out, _sent) = OutgoingAsync::new(false);
            out.carry(flushed.callers);
            if let Err(e) = self.send_request(&out, flushed.frame, flushed.compress, flushed.count) {
                // The new request stays queued; the queue fails it if the
                // connection is gone.
                debug!(connection = %self.desc, error = %e, "Auto-flush failed");
                out.complete(Err(e.into_cause()));
            }
        }
        Ok(queued)
    }

    /// Send every queued batch request as one frame. The returned future
    /// resolves once the frame is written.
    pub fn flush_batch_requests(&self) -> Result<InvocationFuture> {
        let (out, future) = OutgoingAsync::new(false);
        match self.batch.swap() {
            Some(batch) => {
                debug!(connection = %self.desc, count = batch.count, "Flushing batch requests");
                out.carry(batch.callers);
                if let Err(e) = self.send_request(&out, batch.frame, batch.compress, batch.count) {
                    out.complete(Err(e.clone().into_cause()));
                    return Err(e);
                }
            }
            None => {
                out.complete(Ok(Outcome::Sent));
            }
        }
        Ok(future)
    }

    /// Withdraw a pending request. Exactly one of cancellation, reply and
    /// connection failure reaches the caller.
    pub fn cancel_request(&self, out: &Arc<OutgoingAsync>, error: Error) {
        let mut inner = self.lock();
        if inner.state >= State::Closed {
            // The request is failed by the shutdown.
            return;
        }

        if let Some(index) = inner.send_queue.iter().position(|m| m.is_for(out)) {
            let request_id = inner.send_queue[index].request_id;
            if request_id > 0 {
                inner.requests.cancel(request_id);
            }
            if error == Error::ConnectionTimeout {
                self.set_state_with(&mut inner, State::Closed, error);
            } else {
                // A message being written stays queued until it's done.
                if index == 0 {
                    inner.send_queue[0].canceled = true;
                } else {
                    inner.send_queue.remove(index);
                }
                out.complete(Err(error));
                self.notify_all();
            }
            return;
        }

        if out.response() {
            if error == Error::ConnectionTimeout {
                if inner.requests.contains(out.request_id()) {
                    self.set_state_with(&mut inner, State::Closed, error);
                }
            } else if inner
                .requests
                .cancel_where(|pending| Arc::ptr_eq(pending, out))
                .is_some()
            {
                trace!(request_id = out.request_id(), "Canceled pending request");
                out.complete(Err(error));
                self.notify_all();
            }
        }
    }

    /// Send a ValidateConnection frame to the peer.
    pub fn heartbeat(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state >= State::Closed {
            return Err(self.terminal_exception(&inner));
        }
        if inner.state <= State::NotValidated {
            return Err(Error::ConnectionNotValidated {
                reason: "heartbeat before validation".to_string(),
            });
        }
        self.send_heartbeat(&mut inner);
        match &inner.exception {
            Some(e) if inner.state >= State::Closed => Err(e.clone()),
            _ => Ok(()),
        }
    }

    /// Complete a dispatch by sending its reply.
    pub fn send_response(&self, request_id: i32, body: &crate::protocol::ReplyBody, compress: bool) {
        let mut inner = self.lock();
        debug_assert!(inner.state > State::NotValidated);
        self.dispatch_done(&mut inner, 1);

        if inner.state >= State::Closed {
            debug!(request_id, "Connection closed before the reply could be sent");
            return;
        }
        let frame = body.encode(request_id);
        let result = self
            .send_message(&mut inner, OutgoingMessage::control(frame, compress))
            .and_then(|_| self.shutdown_if_idle(&mut inner));
        if let Err(e) = result {
            self.set_state_with(&mut inner, State::Closed, e);
        }
    }

    /// Complete a dispatch that has no reply (one-way and batch requests).
    pub fn send_no_response(&self) {
        let mut inner = self.lock();
        debug_assert!(inner.state > State::NotValidated);
        self.dispatch_done(&mut inner, 1);
        if inner.state >= State::Closed {
            return;
        }
        if let Err(e) = self.shutdown_if_idle(&mut inner) {
            self.set_state_with(&mut inner, State::Closed, e);
        }
    }

    /// Abort `invoke_count` dispatches because the connection can no longer
    /// process them.
    pub fn invoke_exception(&self, error: Error, invoke_count: usize) {
        let mut inner = self.lock();
        self.set_state_with(&mut inner, State::Closed, error);
        if invoke_count > 0 {
            self.dispatch_done(&mut inner, invoke_count);
        }
    }

    /// Bind the adapter incoming requests are dispatched to.
    pub fn set_adapter(&self, adapter: Option<Adapter>) {
        let mut inner = self.lock();
        if inner.state <= State::NotValidated || inner.state >= State::Closing {
            return;
        }
        inner.adapter = adapter;
    }

    /// Register for heartbeat and close notifications. If the connection is
    /// already closed, `closed` runs right away.
    pub fn set_callback(&self, callback: Option<Arc<dyn ConnectionCallback>>) {
        {
            let mut inner = self.lock();
            if inner.state < State::Closed {
                inner.callback = callback;
                return;
            }
        }
        if let (Some(callback), Some(this)) = (callback, self.this.upgrade()) {
            callback.closed(&this);
        }
    }

    /// Override the ACM policy for this connection only.
    pub fn set_acm(
        &self,
        timeout: Option<Duration>,
        close: Option<AcmClose>,
        heartbeat: Option<AcmHeartbeat>,
    ) {
        let mut inner = self.lock();
        if inner.state >= State::Closed {
            return;
        }
        let Some(monitor) = inner.monitor.clone() else {
            return;
        };

        if inner.state == State::Active {
            monitor.remove(self.id);
        }
        let monitor = monitor.acm(timeout, close, heartbeat);
        if !monitor.config().is_enabled() {
            inner.last_activity = None;
        } else if inner.state == State::Active && inner.last_activity.is_none() {
            inner.last_activity = Some(Instant::now());
        }
        if inner.state == State::Active {
            if let Some(this) = self.this.upgrade() {
                monitor.add(&this);
            }
        }
        inner.acm = monitor.config();
        inner.monitor = Some(monitor);
    }

    /// ACM policy in effect for this connection.
    pub fn acm(&self) -> AcmConfig {
        self.lock().acm
    }

    /// Block until the connection is holding (or later) with no dispatch
    /// in progress.
    pub fn wait_until_holding(&self) {
        let mut inner = self.lock();
        while inner.state < State::Holding || inner.dispatch_count > 0 {
            self.cond.wait(&mut inner.guard);
        }
    }

    /// Block until the connection is finished with no dispatch in progress.
    pub fn wait_until_finished(&self) {
        let mut inner = self.lock();
        while inner.state < State::Finished || inner.dispatch_count > 0 {
            self.cond.wait(&mut inner.guard);
        }
        inner.adapter = None;
    }

    /// [`Connection::wait_until_finished`] for async callers.
    pub async fn wait_for_finished(&self) {
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.state >= State::Finished && inner.dispatch_count == 0 {
                    inner.adapter = None;
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn is_active_or_holding(&self) -> bool {
        let state = self.lock().state;
        state > State::NotValidated && state < State::Closing
    }

    pub fn is_finished(&self) -> bool {
        let inner = self.lock();
        inner.state >= State::Finished && inner.dispatch_count == 0
    }

    /// The connection's terminal error, once it has one.
    pub fn check_exception(&self) -> Result<()> {
        match &self.lock().exception {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Apply the ACM policy. Called by the monitor on every tick.
    pub(crate) fn monitor(&self, now: Instant, acm: &AcmConfig) {
        let mut inner = self.lock();
        if inner.state != State::Active {
            return;
        }
        let snapshot = AcmSnapshot {
            idle: inner
                .last_activity
                .map(|last| now.saturating_duration_since(last))
                .unwrap_or_default(),
            write_pending: !inner.send_queue.is_empty(),
            read_in_progress: inner.read_buf.len() > HEADER_SIZE,
            dispatch_count: inner.dispatch_count,
            outstanding_requests: !inner.requests.is_empty(),
            batch_empty: self.batch.is_empty(),
        };
        let decision = crate::acm::evaluate(acm, &snapshot);
        if decision.heartbeat {
            trace!(connection = %self.desc, idle_ms = snapshot.idle.as_millis() as u64, "Sending heartbeat");
            self.send_heartbeat(&mut inner);
        }
        match decision.close {
            CloseAction::None => {}
            CloseAction::Forceful => {
                debug!(connection = %self.desc, "Closing connection with outstanding requests after idle timeout");
                self.set_state_with(&mut inner, State::Closed, Error::ConnectionTimeout);
            }
            CloseAction::Graceful => {
                debug!(connection = %self.desc, "Closing idle connection");
                self.set_state_with(&mut inner, State::Closing, Error::ConnectionTimeout);
            }
        }
    }

    /// Fail the connection from outside the I/O path.
    pub(crate) fn exception(&self, error: Error) {
        let mut inner = self.lock();
        self.set_state_with(&mut inner, State::Closed, error);
    }

    fn timed_out(&self, seq: u64, timeout: Duration) {
        let mut inner = self.lock();
        let current = [&inner.read_timeout, &inner.write_timeout]
            .into_iter()
            .flatten()
            .any(|t| t.seq == seq);
        if !current {
            return;
        }
        let error = if inner.state <= State::NotValidated {
            Error::ConnectTimeout { timeout }
        } else if inner.state < State::Closing {
            Error::Timeout { timeout }
        } else if inner.state < State::Closed {
            Error::CloseTimeout { timeout }
        } else {
            return;
        };
        debug!(connection = %self.desc, state = %inner.state, error = %error, "Connection timed out");
        self.set_state_with(&mut inner, State::Closed, error);
    }

    fn terminal_exception(&self, inner: &Inner) -> Error {
        inner.exception.clone().unwrap_or_else(|| {
            error!(connection = %self.desc, state = %inner.state, "Connection has no terminal error");
            Error::ConnectionLost {
                reason: "connection closed".to_string(),
            }
        })
    }

    fn notify_all(&self) {
        self.cond.notify_all();
        self.state_changed.notify_waiters();
    }

    /// Record an event for the instance observer, if there is one.
    fn observe(&self, inner: &mut Inner, event: impl FnOnce() -> Observed) {
        if self.instance.observer().is_some() {
            inner.observed.push(event());
        }
    }

    fn deliver(&self, events: Vec<Observed>) {
        let Some(observer) = self.instance.observer() else {
            return;
        };
        let delivered = catch_unwind(AssertUnwindSafe(|| {
            for event in events {
                match event {
                    Observed::StateChanged(old, new) => observer.state_changed(&self.desc, old, new),
                    Observed::SentBytes(count) => observer.sent_bytes(&self.desc, count),
                    Observed::ReceivedBytes(count) => observer.received_bytes(&self.desc, count),
                    Observed::Failed(error) => observer.failed(&self.desc, &error),
                }
            }
        }));
        if delivered.is_err() {
            warn!(connection = %self.desc, "Connection observer panicked");
        }
    }

    /// Record the first error and move to `state`.
    fn set_state_with(&self, inner: &mut Inner, state: State, error: Error) {
        if inner.state == state {
            return;
        }
        if inner.exception.is_none() {
            let expected = error.is_expected_close(inner.state >= State::Closing);
            if !expected {
                if self.instance.warn_connections() && inner.state > State::NotValidated {
                    warn!(connection = %self.desc, state = %inner.state, error = %error, "Connection failed");
                } else {
                    debug!(connection = %self.desc, state = %inner.state, error = %error, "Connection failed");
                }
                self.observe(inner, || Observed::Failed(error.clone()));
            } else {
                debug!(connection = %self.desc, reason = %error, "Connection closing");
            }
            inner.exception = Some(error);
        }
        self.set_state(inner, state);
    }

    fn set_state(&self, inner: &mut Inner, mut state: State) {
        // Datagram and unvalidated connections have no close handshake.
        if state == State::Closing && (self.datagram || inner.state <= State::NotValidated) {
            state = State::Closed;
        }
        if inner.state == state {
            return;
        }

        match state {
            State::NotInitialized => {
                debug_assert!(false, "connection cannot return to not-initialized");
                return;
            }
            State::NotValidated => {
                if inner.state != State::NotInitialized {
                    debug_assert!(inner.state == State::Closed);
                    return;
                }
            }
            State::Active => {
                if inner.state != State::Holding && inner.state != State::NotValidated {
                    return;
                }
                self.registration.add(SocketOperation::READ);
            }
            State::Holding => {
                if inner.state != State::Active && inner.state != State::NotValidated {
                    return;
                }
                if inner.state == State::Active {
                    self.registration.remove(SocketOperation::READ);
                }
            }
            State::Closing | State::ClosingPending => {
                if inner.state >= State::ClosingPending {
                    return;
                }
            }
            State::Closed => {
                if inner.state == State::Finished {
                    return;
                }
                let exception = self.terminal_exception(inner);
                let failed = self.batch.destroy(exception);
                if failed > 0 {
                    debug!(connection = %self.desc, failed, "Failed queued batch requests");
                }
                self.registration.finish();
            }
            State::Finished => {
                debug_assert!(inner.state == State::Closed);
                inner.adapter = None;
            }
        }

        if let Some(monitor) = inner.monitor.clone() {
            if state == State::Active {
                if inner.last_activity.is_some() {
                    inner.last_activity = Some(Instant::now());
                }
                if let Some(this) = self.this.upgrade() {
                    monitor.add(&this);
                }
            } else if inner.state == State::Active {
                monitor.remove(self.id);
            }
        }

        let from = inner.state;
        self.observe(inner, || Observed::StateChanged(from, state));
        trace!(connection = %self.desc, from = %inner.state, to = %state, "State transition");
        inner.state = state;
        self.notify_all();

        if inner.state == State::Closing && inner.dispatch_count == 0 {
            if let Err(e) = self.initiate_shutdown(inner) {
                self.set_state_with(inner, State::Closed, e);
            }
        }
    }

    /// Send the close frame once nothing is dispatching.
    fn initiate_shutdown(&self, inner: &mut Inner) -> Result<()> {
        debug_assert!(inner.state == State::Closing && inner.dispatch_count == 0);
        if inner.shutdown_initiated {
            return Ok(());
        }
        inner.shutdown_initiated = true;

        if !self.datagram {
            debug!(connection = %self.desc, "Sending close connection message");
            let message = OutgoingMessage::control(control_frame(MessageType::CloseConnection), false);
            let status = self.send_message(inner, message)?;
            if matches!(status, SendStatus::Sent(_)) {
                self.set_state(inner, State::ClosingPending);
                let exception = self.terminal_exception(inner);
                let op = self.transceiver.closing(true, &exception);
                if !op.is_empty() {
                    self.schedule_timeout(inner, op);
                    self.registration.add(op);
                }
            }
        }
        Ok(())
    }

    fn shutdown_if_idle(&self, inner: &mut Inner) -> Result<()> {
        if inner.state == State::Closing && inner.dispatch_count == 0 {
            self.initiate_shutdown(inner)?;
        }
        Ok(())
    }

    fn send_heartbeat(&self, inner: &mut Inner) {
        if self.datagram {
            return;
        }
        let message = OutgoingMessage::control(control_frame(MessageType::ValidateConnection), false);
        if let Err(e) = self.send_message(inner, message) {
            self.set_state_with(inner, State::Closed, e);
        }
    }

    /// Account for finished dispatches.
    fn dispatch_done(&self, inner: &mut Inner, count: usize) {
        debug_assert!(inner.dispatch_count >= count);
        inner.dispatch_count = inner.dispatch_count.saturating_sub(count);
        if inner.dispatch_count == 0 {
            if inner.state == State::Finished {
                self.reap(inner);
            }
            self.notify_all();
        }
    }

    /// Hand the finished connection to its factory. The monitor reference
    /// is dropped here, so the factory's registry is the last owner.
    fn reap(&self, inner: &mut Inner) {
        if let (Some(monitor), Some(this)) = (inner.monitor.take(), self.this.upgrade()) {
            monitor.reap(this);
        }
    }

    fn schedule_timeout(&self, inner: &mut Inner, mut status: SocketOperation) {
        let timeout = if inner.state < State::Active {
            self.instance
                .connect_timeout()
                .unwrap_or(self.endpoint.timeout)
        } else if inner.state < State::ClosingPending {
            // Waiting for the next header is idle time, not a stalled read.
            if inner.read_header {
                status -= SocketOperation::READ;
            }
            self.endpoint.timeout
        } else {
            self.instance.close_timeout().unwrap_or(self.endpoint.timeout)
        };
        let Some(timeout) = timeout else {
            return;
        };

        if status.contains(SocketOperation::READ) {
            let scheduled = self.schedule_timer(inner, timeout);
            if let Some(previous) = inner.read_timeout.replace(scheduled) {
                previous.task.cancel();
            }
        }
        if status.intersects(SocketOperation::WRITE | SocketOperation::CONNECT) {
            let scheduled = self.schedule_timer(inner, timeout);
            if let Some(previous) = inner.write_timeout.replace(scheduled) {
                previous.task.cancel();
            }
        }
    }

    fn schedule_timer(&self, inner: &mut Inner, timeout: Duration) -> ScheduledTimeout {
        inner.timeout_seq += 1;
        let seq = inner.timeout_seq;
        let this = self.this.clone();
        let task = self.instance.timer().schedule(timeout, move || {
            if let Some(connection) = this.upgrade() {
                connection.timed_out(seq, timeout);
            }
        });
        ScheduledTimeout { task, seq }
    }

    fn unschedule_timeout(&self, inner: &mut Inner, status: SocketOperation) {
        if status.contains(SocketOperation::READ) {
            if let Some(scheduled) = inner.read_timeout.take() {
                scheduled.task.cancel();
            }
        }
        if status.intersects(SocketOperation::WRITE | SocketOperation::CONNECT) {
            if let Some(scheduled) = inner.write_timeout.take() {
                scheduled.task.cancel();
            }
        }
    }
}
