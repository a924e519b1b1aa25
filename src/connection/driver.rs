//! Per-connection I/O driver: waits for transport readiness and feeds it
//! back into the connection.

use super::Connection;
use crate::error::Error;
use crate::transport::SocketOperation;
use parking_lot::Mutex;
use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Readiness the driver waits for, shared between the connection and its
/// driver task.
#[derive(Debug, Default)]
pub(crate) struct Registration {
    interest: Mutex<SocketOperation>,
    finishing: AtomicBool,
    changed: Notify,
}

impl Registration {
    pub(crate) fn interest(&self) -> SocketOperation {
        *self.interest.lock()
    }

    /// Stop waiting for `remove`, start waiting for `add`.
    pub(crate) fn update(&self, remove: SocketOperation, add: SocketOperation) {
        let mut interest = self.interest.lock();
        let updated = (*interest - remove) | add;
        if updated != *interest {
            trace!(from = ?*interest, to = ?updated, "Updating readiness interest");
            *interest = updated;
            self.changed.notify_one();
        }
    }

    pub(crate) fn add(&self, op: SocketOperation) {
        self.update(SocketOperation::NONE, op);
    }

    pub(crate) fn remove(&self, op: SocketOperation) {
        self.update(op, SocketOperation::NONE);
    }

    /// Ask the driver to stop and finish the connection.
    pub(crate) fn finish(&self) {
        self.finishing.store(true, Ordering::Release);
        self.changed.notify_one();
    }

    fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::Acquire)
    }
}

/// Drive `connection` until it is closed, then finish it.
pub(crate) async fn run(connection: Arc<Connection>) {
    let registration = connection.registration();
    let transceiver = connection.transceiver().clone();

    while !registration.is_finishing() {
        let interest = registration.interest();
        if interest.is_empty() {
            registration.changed.notified().await;
            continue;
        }

        tokio::select! {
            ready = poll_fn(|cx| transceiver.poll_ready(cx, interest)) => match ready {
                Ok(ready) => connection.message(ready & interest),
                Err(e) => connection.exception(Error::from_io(&e, "poll")),
            },
            _ = registration.changed.notified() => {}
        }
    }

    debug!(connection = %connection.description(), "I/O driver finishing connection");
    connection.finish();
}
