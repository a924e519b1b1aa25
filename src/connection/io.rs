//! Readiness handling: framing, parsing, the send queue and upcalls.

use super::{Connection, Inner, Observed, StartCallback, State};
use crate::connection::ConnectionCallback;
use crate::dispatch::{panic_message, reply_for_error, Adapter, DispatchOutcome, IncomingRequest};
use crate::error::{Error, Result};
use crate::outgoing::{OutgoingAsync, OutgoingMessage, Outcome};
use crate::protocol::compress::{decompress_frame, prepare_frame};
use crate::protocol::header::{
    control_frame, decode_prefix, CompressionStatus, MessageType, COMPRESSION_OFFSET,
    HEADER_SIZE, MESSAGE_TYPE_OFFSET,
};
use crate::protocol::message::{read_request, Reply, ReplyBody};
use crate::protocol::stream::InputStream;
use crate::transport::{Buffer, SocketOperation};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Result of handing a frame to the send path.
pub(super) enum SendStatus {
    /// Waiting behind other frames or for write readiness.
    Queued,
    /// Fully written; carries the record whose sent callbacks must run.
    Sent(Option<Arc<OutgoingAsync>>),
}

/// Work collected under the lock and run after it is released.
#[derive(Default)]
struct Upcall {
    start: Option<StartCallback>,
    sent: Vec<Arc<OutgoingAsync>>,
    reply: Option<(Arc<OutgoingAsync>, Reply)>,
    heartbeat: Option<Arc<dyn ConnectionCallback>>,
    requests: Vec<IncomingRequest>,
    adapter: Option<Adapter>,
    /// Dispatch units this upcall holds on the connection.
    units: usize,
}

impl Connection {
    /// Handle readiness reported by the driver.
    pub(crate) fn message(&self, ready: SocketOperation) {
        if ready.is_empty() {
            return;
        }
        let mut upcall = Upcall::default();
        {
            let mut inner = self.lock();
            if inner.state >= State::Closed {
                return;
            }
            self.unschedule_timeout(&mut inner, ready);

            if let Err(e) = self.handle_ready(&mut inner, ready, &mut upcall) {
                match e {
                    Error::DatagramLimit { size } if self.datagram => {
                        if self.instance.warn_datagrams() {
                            warn!(connection = %self.desc, size, "Maximum datagram size exceeded");
                        }
                        self.reset_read_buffer(&mut inner);
                    }
                    Error::Socket { .. } | Error::ConnectionLost { .. } => {
                        self.set_state_with(&mut inner, State::Closed, e);
                    }
                    e if self.datagram => {
                        if self.instance.warn_datagrams() {
                            warn!(connection = %self.desc, error = %e, "Discarding corrupt datagram");
                        } else {
                            debug!(connection = %self.desc, error = %e, "Discarding corrupt datagram");
                        }
                        self.reset_read_buffer(&mut inner);
                    }
                    e => self.set_state_with(&mut inner, State::Closed, e),
                }
                return;
            }

            if upcall.units == 0 {
                return;
            }
            inner.dispatch_count += upcall.units;
        }
        self.upcall(upcall);
    }

    fn handle_ready(
        &self,
        inner: &mut Inner,
        ready: SocketOperation,
        upcall: &mut Upcall,
    ) -> Result<()> {
        let mut write_op = SocketOperation::NONE;
        let mut read_op = SocketOperation::NONE;

        if ready.contains(SocketOperation::WRITE) {
            write_op = self.write_pending(inner)?;
        }

        if ready.contains(SocketOperation::READ) {
            loop {
                read_op = self.transceiver.read(&mut inner.read_buf)?;
                if read_op.contains(SocketOperation::READ) {
                    break;
                }
                if inner.read_header {
                    inner.read_header = false;
                    let pos = inner.read_buf.pos();
                    if pos < HEADER_SIZE {
                        return Err(Error::IllegalMessageSize { size: pos as i64 });
                    }
                    let size = decode_prefix(
                        &inner.read_buf.as_slice()[..pos],
                        self.instance.message_size_max(),
                    )?;
                    if size > inner.read_buf.len() {
                        inner.read_buf.resize(size);
                    }
                    inner.read_buf.set_pos(pos);
                }
                if inner.read_buf.has_remaining() {
                    if self.datagram {
                        // The datagram was truncated.
                        return Err(Error::DatagramLimit {
                            size: inner.read_buf.len(),
                        });
                    }
                    continue;
                }
                break;
            }
        }

        let mut new_op = read_op | write_op;
        let ready = ready - new_op;

        if inner.state <= State::NotValidated {
            if !new_op.is_empty() {
                self.schedule_timeout(inner, new_op);
                self.registration.update(ready, new_op);
                return Ok(());
            }
            if !self.handshake(inner, ready)? {
                return Ok(());
            }
            self.registration.remove(ready);
            self.set_state(inner, State::Holding);
            if let Some(start) = inner.start_callback.take() {
                upcall.start = Some(start);
                upcall.units += 1;
            }
        } else {
            debug_assert!(inner.state <= State::ClosingPending);
            // Parse first: after a close message nothing more is sent.
            if ready.contains(SocketOperation::READ) {
                new_op |= self.parse_message(inner, upcall);
            }
            if ready.contains(SocketOperation::WRITE) {
                new_op |= self.send_next_message(inner, &mut upcall.sent);
                if !upcall.sent.is_empty() {
                    upcall.units += 1;
                }
            }
            if inner.state < State::Closed {
                self.schedule_timeout(inner, new_op);
                self.registration.update(ready, new_op);
            }
        }

        if inner.last_activity.is_some() {
            inner.last_activity = Some(Instant::now());
        }
        Ok(())
    }

    /// Continue writing the frame at the head of the send queue, or the
    /// validation frame while the handshake runs.
    fn write_pending(&self, inner: &mut Inner) -> Result<SocketOperation> {
        if inner.state <= State::NotValidated {
            if inner.write_buf.has_remaining() {
                return self.transceiver.write(&mut inner.write_buf);
            }
            return Ok(SocketOperation::NONE);
        }
        match inner.send_queue.front_mut() {
            Some(message) if message.buffer.has_remaining() => {
                self.transceiver.write(&mut message.buffer)
            }
            _ => Ok(SocketOperation::NONE),
        }
    }

    fn reset_read_buffer(&self, inner: &mut Inner) {
        inner.read_buf = Buffer::with_len(HEADER_SIZE);
        inner.read_header = true;
    }

    /// Run whichever handshake steps are left. Returns `false` while waiting
    /// for readiness.
    pub(super) fn handshake(&self, inner: &mut Inner, ready: SocketOperation) -> Result<bool> {
        if inner.state == State::NotInitialized && !self.initialize(inner, ready)? {
            return Ok(false);
        }
        if inner.state <= State::NotValidated && !self.validate(inner, ready)? {
            return Ok(false);
        }
        Ok(true)
    }

    fn initialize(&self, inner: &mut Inner, ready: SocketOperation) -> Result<bool> {
        let op = self
            .transceiver
            .initialize(&mut inner.read_buf, &mut inner.write_buf)?;
        if !op.is_empty() {
            self.schedule_timeout(inner, op);
            self.registration.update(ready, op);
            return Ok(false);
        }
        inner.initialized = true;
        self.set_state(inner, State::NotValidated);
        Ok(true)
    }

    /// The accepting side sends a ValidateConnection frame, the connecting
    /// side waits for it. Datagram connections skip the exchange.
    fn validate(&self, inner: &mut Inner, ready: SocketOperation) -> Result<bool> {
        if !self.datagram {
            if self.incoming {
                if inner.write_buf.is_empty() {
                    trace!(connection = %self.desc, "Sending validate connection message");
                    inner.write_buf = Buffer::from_vec(control_frame(MessageType::ValidateConnection));
                }
                if inner.write_buf.has_remaining() {
                    let op = self.transceiver.write(&mut inner.write_buf)?;
                    if !op.is_empty() {
                        self.schedule_timeout(inner, op);
                        self.registration.update(ready, op);
                        return Ok(false);
                    }
                }
            } else {
                if inner.read_buf.len() < HEADER_SIZE {
                    inner.read_buf = Buffer::with_len(HEADER_SIZE);
                }
                if inner.read_buf.pos() < HEADER_SIZE {
                    let op = self.transceiver.read(&mut inner.read_buf)?;
                    if !op.is_empty() {
                        self.schedule_timeout(inner, op);
                        self.registration.update(ready, op);
                        return Ok(false);
                    }
                }

                inner.validated = true;
                let frame = &inner.read_buf.as_slice()[..HEADER_SIZE];
                let size = decode_prefix(frame, 0)?;
                let message_type = frame[MESSAGE_TYPE_OFFSET];
                if message_type != MessageType::ValidateConnection as u8 {
                    let reason = match MessageType::try_from(message_type) {
                        Ok(t) => format!("{} message", t),
                        Err(_) => format!("message type {}", message_type),
                    };
                    return Err(Error::ConnectionNotValidated { reason });
                }
                if size != HEADER_SIZE {
                    return Err(Error::IllegalMessageSize { size: size as i64 });
                }
                trace!(connection = %self.desc, "Received validate connection message");
            }
        }

        inner.write_buf.clear();
        self.reset_read_buffer(inner);

        if self.incoming {
            debug!(connection = %self.desc, "Accepted connection");
        } else {
            debug!(connection = %self.desc, "Established connection");
        }
        Ok(true)
    }

    /// Decode the fully read frame in the read buffer.
    fn parse_message(&self, inner: &mut Inner, upcall: &mut Upcall) -> SocketOperation {
        debug_assert!(inner.state > State::NotValidated && inner.state < State::Closed);

        let frame = std::mem::replace(&mut inner.read_buf, Buffer::with_len(HEADER_SIZE)).take();
        inner.read_header = true;
        // Only validated connections warn about failures.
        inner.validated = true;

        let received = frame.len();
        self.observe(inner, || Observed::ReceivedBytes(received));

        match self.decode_message(inner, frame, upcall) {
            Ok(Some(op)) => return op,
            Ok(None) => {}
            Err(e) => {
                if self.datagram {
                    if self.instance.warn_connections() {
                        warn!(connection = %self.desc, error = %e, "Datagram connection error");
                    }
                } else {
                    self.set_state_with(inner, State::Closed, e);
                }
            }
        }

        if inner.state == State::Holding {
            SocketOperation::NONE
        } else {
            SocketOperation::READ
        }
    }

    fn decode_message(
        &self,
        inner: &mut Inner,
        frame: Vec<u8>,
        upcall: &mut Upcall,
    ) -> Result<Option<SocketOperation>> {
        let message_type = MessageType::try_from(frame[MESSAGE_TYPE_OFFSET])?;
        let compression = CompressionStatus::try_from(frame[COMPRESSION_OFFSET])?;
        let frame = if compression == CompressionStatus::Compressed {
            decompress_frame(&frame, self.instance.message_size_max())?
        } else {
            frame
        };
        let compress = compression != CompressionStatus::None;
        let mut input = InputStream::at(&frame, HEADER_SIZE);
        trace!(connection = %self.desc, %message_type, size = frame.len(), "Received message");

        match message_type {
            MessageType::CloseConnection => {
                if self.datagram {
                    if self.instance.warn_connections() {
                        warn!(connection = %self.desc, "Ignoring close connection message for datagram connection");
                    }
                } else {
                    self.set_state_with(inner, State::ClosingPending, Error::CloseConnection);
                    // Acknowledge by closing our side.
                    let op = self.transceiver.closing(false, &Error::CloseConnection);
                    if !op.is_empty() {
                        return Ok(Some(op));
                    }
                    self.set_state(inner, State::Closed);
                }
            }
            MessageType::Request => {
                if inner.state >= State::Closing {
                    trace!(connection = %self.desc, "Ignoring request received while closing");
                } else {
                    let request_id = input.read_i32()?;
                    let (header, params) = read_request(&mut input)?;
                    upcall.requests.push(IncomingRequest {
                        request_id,
                        header,
                        params,
                        compress,
                    });
                    upcall.adapter = inner.adapter.clone();
                }
            }
            MessageType::RequestBatch => {
                if inner.state >= State::Closing {
                    trace!(connection = %self.desc, "Ignoring batch request received while closing");
                } else {
                    let count = input.read_i32()?;
                    if count < 0 {
                        return Err(Error::unmarshal(format!("negative batch request count {}", count)));
                    }
                    for _ in 0..count {
                        let (header, params) = read_request(&mut input)?;
                        upcall.requests.push(IncomingRequest {
                            request_id: 0,
                            header,
                            params,
                            compress,
                        });
                    }
                    upcall.adapter = inner.adapter.clone();
                }
            }
            MessageType::Reply => {
                let reply = Reply::decode(input.rest())?;
                match inner.requests.resolve(reply.request_id) {
                    Some(out) => {
                        trace!(request_id = reply.request_id, status = ?reply.status, "Received reply");
                        upcall.reply = Some((out, reply));
                        upcall.units += 1;
                    }
                    None => {
                        debug!(
                            connection = %self.desc,
                            request_id = reply.request_id,
                            "Discarding reply for unknown request"
                        );
                    }
                }
                // Wake graceful closes waiting for outstanding requests.
                self.notify_all();
            }
            MessageType::ValidateConnection => {
                trace!(connection = %self.desc, "Received heartbeat");
                if let Some(callback) = &inner.callback {
                    upcall.heartbeat = Some(callback.clone());
                    upcall.units += 1;
                }
            }
        }

        upcall.units += upcall.requests.len();
        Ok(None)
    }

    /// Compress and size the frame, once.
    fn prepare(&self, message: &mut OutgoingMessage) {
        if message.prepared {
            return;
        }
        let frame = message.buffer.take();
        message.buffer = Buffer::from_vec(prepare_frame(
            frame,
            message.compress,
            self.instance.compression_level(),
        ));
        message.prepared = true;
    }

    /// Write `message` now if nothing is queued, otherwise queue it.
    pub(super) fn send_message(
        &self,
        inner: &mut Inner,
        mut message: OutgoingMessage,
    ) -> Result<SendStatus> {
        debug_assert!(inner.state < State::Closed);

        if !inner.send_queue.is_empty() {
            inner.send_queue.push_back(message);
            return Ok(SendStatus::Queued);
        }

        self.prepare(&mut message);
        let op = self.transceiver.write(&mut message.buffer)?;
        if op.is_empty() {
            let count = message.buffer.len();
            self.observe(inner, || Observed::SentBytes(count));
            if inner.last_activity.is_some() {
                inner.last_activity = Some(Instant::now());
            }
            return Ok(SendStatus::Sent(message.sent()));
        }

        inner.send_queue.push_back(message);
        self.schedule_timeout(inner, op);
        self.registration.add(op);
        Ok(SendStatus::Queued)
    }

    /// Called once the head of the queue is fully written: retire it and
    /// keep writing until the socket would block.
    fn send_next_message(
        &self,
        inner: &mut Inner,
        sent: &mut Vec<Arc<OutgoingAsync>>,
    ) -> SocketOperation {
        match self.try_send_next_message(inner, sent) {
            Ok(op) => op,
            Err(e) => {
                self.set_state_with(inner, State::Closed, e);
                SocketOperation::NONE
            }
        }
    }

    fn try_send_next_message(
        &self,
        inner: &mut Inner,
        sent: &mut Vec<Arc<OutgoingAsync>>,
    ) -> Result<SocketOperation> {
        match inner.send_queue.front() {
            None => return Ok(SocketOperation::NONE),
            // Nothing of the next frame went out; the close is underway.
            Some(message) if inner.state == State::ClosingPending && message.buffer.pos() == 0 => {
                return Ok(SocketOperation::NONE)
            }
            Some(_) => {}
        }

        while let Some(mut message) = inner.send_queue.pop_front() {
            debug_assert!(!message.buffer.has_remaining());
            let count = message.buffer.len();
            self.observe(inner, || Observed::SentBytes(count));
            if let Some(out) = message.sent() {
                sent.push(out);
            }

            if inner.send_queue.is_empty() {
                break;
            }
            // parse_message may have closed the connection.
            if inner.state >= State::ClosingPending {
                return Ok(SocketOperation::NONE);
            }

            let Some(next) = inner.send_queue.front_mut() else {
                break;
            };
            self.prepare(next);
            if next.buffer.has_remaining() {
                let op = self.transceiver.write(&mut next.buffer)?;
                if !op.is_empty() {
                    return Ok(op);
                }
            }
        }

        // Everything is out; wait for the peer to close.
        if inner.state == State::Closing && inner.shutdown_initiated {
            self.set_state(inner, State::ClosingPending);
            let exception = self.terminal_exception(inner);
            let op = self.transceiver.closing(true, &exception);
            if !op.is_empty() {
                return Ok(op);
            }
        }
        Ok(SocketOperation::NONE)
    }

    /// Run collected callbacks and dispatches without the lock.
    fn upcall(&self, upcall: Upcall) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut completed = 0;

        if let Some(start) = upcall.start {
            start(Ok(()));
            completed += 1;
        }

        if !upcall.sent.is_empty() {
            for out in &upcall.sent {
                out.invoke_sent();
            }
            completed += 1;
        }

        if let Some((out, reply)) = upcall.reply {
            out.complete(Ok(Outcome::Reply(reply)));
            completed += 1;
        }

        if let Some(callback) = upcall.heartbeat {
            if catch_unwind(AssertUnwindSafe(|| callback.heartbeat(&this))).is_err() {
                warn!(connection = %self.desc, "Heartbeat callback panicked");
            }
            completed += 1;
        }

        // Each dispatch releases its unit when it replies.
        for request in upcall.requests {
            this.dispatch(upcall.adapter.as_ref(), request);
        }

        if completed > 0 {
            let mut inner = self.lock();
            debug_assert!(inner.dispatch_count >= completed);
            inner.dispatch_count = inner.dispatch_count.saturating_sub(completed);
            if inner.dispatch_count == 0 {
                if inner.state == State::Closing {
                    if let Err(e) = self.initiate_shutdown(&mut inner) {
                        self.set_state_with(&mut inner, State::Closed, e);
                    }
                } else if inner.state == State::Finished {
                    self.reap(&mut inner);
                }
                self.notify_all();
            }
        }
    }

    fn dispatch(self: &Arc<Self>, adapter: Option<&Adapter>, request: IncomingRequest) {
        let request_id = request.request_id;
        let compress = request.compress;
        let header = request.header.clone();

        let outcome = match adapter {
            None => Ok(DispatchOutcome::Reply(ReplyBody::ObjectNotExist(header.clone()))),
            Some(adapter) => {
                let dispatcher = adapter.dispatcher();
                catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(request))).unwrap_or_else(
                    |panic| {
                        let reason = panic_message(panic.as_ref());
                        warn!(connection = %self.desc, operation = %header.operation, reason = %reason, "Dispatcher panicked");
                        Ok(DispatchOutcome::Reply(ReplyBody::Unknown(reason)))
                    },
                )
            }
        };

        let body = match outcome {
            Ok(DispatchOutcome::Reply(body)) => body,
            Ok(DispatchOutcome::Pending(future)) => {
                let runtime = self.instance.timer().runtime().clone();
                let pending = runtime.spawn(future);
                let connection = self.clone();
                runtime.spawn(async move {
                    let body = match pending.await {
                        Ok(body) => body,
                        Err(e) if e.is_panic() => {
                            ReplyBody::Unknown(panic_message(e.into_panic().as_ref()))
                        }
                        Err(_) => ReplyBody::UnknownLocal("dispatch canceled".to_string()),
                    };
                    connection.finish_dispatch(request_id, compress, body);
                });
                return;
            }
            Err(e) => reply_for_error(e, &header),
        };
        self.finish_dispatch(request_id, compress, body);
    }

    fn finish_dispatch(&self, request_id: i32, compress: bool, body: ReplyBody) {
        if request_id == 0 {
            self.send_no_response();
        } else {
            self.send_response(request_id, &body, compress);
        }
    }

    /// Tear down after `Closed`: release the transport and fail everything
    /// still pending. Runs on the driver task.
    pub(crate) fn finish(&self) {
        let (messages, requests, start, callback, exception) = {
            let mut inner = self.lock();
            debug_assert!(inner.state == State::Closed);
            self.unschedule_timeout(
                &mut inner,
                SocketOperation::READ | SocketOperation::WRITE | SocketOperation::CONNECT,
            );

            let exception = self.terminal_exception(&inner);
            if !inner.initialized {
                debug!(connection = %self.desc, error = %exception, "Failed to establish connection");
            } else {
                debug!(connection = %self.desc, reason = %exception, "Closed connection");
            }
            self.transceiver.close();

            let messages: Vec<OutgoingMessage> = inner.send_queue.drain(..).collect();
            for message in &messages {
                if message.request_id > 0 {
                    inner.requests.cancel(message.request_id);
                }
            }
            let requests = inner.requests.drain();
            inner.read_buf.clear();
            inner.write_buf.clear();
            (
                messages,
                requests,
                inner.start_callback.take(),
                inner.callback.take(),
                exception,
            )
        };

        if let Some(start) = start {
            start(Err(exception.clone()));
        }
        for mut message in messages {
            message.completed(&exception);
        }
        for (request_id, out) in requests {
            trace!(request_id, "Failing outstanding request");
            out.complete(Err(exception.clone()));
        }
        if let (Some(callback), Some(this)) = (callback, self.this.upgrade()) {
            if catch_unwind(AssertUnwindSafe(|| callback.closed(&this))).is_err() {
                warn!(connection = %self.desc, "Close callback panicked");
            }
        }

        let mut inner = self.lock();
        self.set_state(&mut inner, State::Finished);
        if inner.dispatch_count == 0 {
            self.reap(&mut inner);
        }
    }
}
