//! Common test utilities shared by the integration tests.

#![allow(dead_code)]

use floe::acm::{AcmConfig, ConnectionMonitor};
use floe::dispatch::{Adapter, DispatchOutcome, IncomingRequest};
use floe::observer::ConnectionObserver;
use floe::outgoing::{OutgoingAsync, Outcome};
use floe::protocol::compress::prepare_frame;
use floe::protocol::message::request_frame;
use floe::protocol::{ReplyBody, RequestHeader};
use floe::transport::MemoryTransceiver;
use floe::{Config, Connection, Endpoint, Error, Instance, State};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_instance() -> Arc<Instance> {
    Instance::with_config(Config::for_testing()).unwrap()
}

/// Records dispatched operations and implements a few test operations:
///
/// - `echo` returns its parameters
/// - `slow` replies with its parameters once the gate is opened
/// - `panic` panics inside the dispatcher
/// - `fail` raises an application error
#[derive(Default)]
pub struct TestServant {
    pub calls: Mutex<Vec<String>>,
    pub gate: Arc<Notify>,
}

impl TestServant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn adapter(self: &Arc<Self>) -> Adapter {
        let servant = self.clone();
        Adapter::new(
            "test",
            Arc::new(move |request: IncomingRequest| servant.dispatch(request)),
        )
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Let one pending `slow` request reply.
    pub fn open_gate(&self) {
        self.gate.notify_one();
    }

    fn dispatch(&self, request: IncomingRequest) -> Result<DispatchOutcome, Error> {
        self.calls.lock().push(request.operation().to_string());
        match request.operation() {
            "echo" => Ok(DispatchOutcome::Reply(ReplyBody::Ok(request.params))),
            "slow" => {
                let gate = self.gate.clone();
                let params = request.params;
                Ok(DispatchOutcome::Pending(Box::pin(async move {
                    gate.notified().await;
                    ReplyBody::Ok(params)
                })))
            }
            "panic" => panic!("boom"),
            "fail" => Err(Error::UserException {
                payload: b"failed".to_vec(),
            }),
            _ => Ok(DispatchOutcome::Reply(ReplyBody::Ok(Vec::new()))),
        }
    }
}

/// Counts observer events.
#[derive(Default)]
pub struct CountingObserver {
    pub sent: AtomicUsize,
    pub received: AtomicUsize,
    pub failures: AtomicUsize,
    pub transitions: Mutex<Vec<(State, State)>>,
}

impl ConnectionObserver for CountingObserver {
    fn state_changed(&self, _connection: &str, old: State, new: State) {
        self.transitions.lock().push((old, new));
    }

    fn sent_bytes(&self, _connection: &str, count: usize) {
        self.sent.fetch_add(count, Ordering::SeqCst);
    }

    fn received_bytes(&self, _connection: &str, count: usize) {
        self.received.fetch_add(count, Ordering::SeqCst);
    }

    fn failed(&self, _connection: &str, _error: &Error) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct PairOptions {
    pub adapter: Option<Adapter>,
    pub client_acm: Option<AcmConfig>,
    pub server_acm: Option<AcmConfig>,
}

/// A client and server connection joined by an in-memory pipe, both
/// validated and active.
pub async fn connected_pair(instance: &Arc<Instance>, options: PairOptions) -> (Arc<Connection>, Arc<Connection>) {
    let (a, b) = MemoryTransceiver::pair();
    let monitor = |acm: Option<AcmConfig>| acm.map(|acm| ConnectionMonitor::new(acm, instance.timer().clone()));

    let server = Connection::new(
        instance.clone(),
        Arc::new(b),
        Endpoint::memory("server"),
        true,
        monitor(options.server_acm),
        options.adapter,
    );
    let client = Connection::new(
        instance.clone(),
        Arc::new(a),
        Endpoint::memory("client"),
        false,
        monitor(options.client_acm),
        None,
    );

    let (client_started, server_started) = tokio::join!(client.start_async(), server.start_async());
    client_started.unwrap();
    server_started.unwrap();
    client.activate();
    server.activate();
    (client, server)
}

/// Pair with `adapter` on the server side and no ACM.
pub async fn echo_pair(instance: &Arc<Instance>, adapter: Adapter) -> (Arc<Connection>, Arc<Connection>) {
    connected_pair(
        instance,
        PairOptions {
            adapter: Some(adapter),
            client_acm: None,
            server_acm: None,
        },
    )
    .await
}

/// Send a request on `connection`. The returned future resolves with the
/// reply parameters.
pub fn send(
    connection: &Arc<Connection>,
    operation: &str,
    params: &[u8],
    compress: bool,
) -> (Arc<OutgoingAsync>, impl Future<Output = Result<Vec<u8>, Error>>) {
    let (out, future) = OutgoingAsync::new(true);
    let frame = request_frame(&RequestHeader::new("test", operation), params);
    let sent = connection.send_request(&out, frame, compress, 0);
    let result = async move {
        sent?;
        match future.await? {
            Outcome::Reply(reply) => reply.into_result(),
            Outcome::Sent => panic!("two-way request completed without a reply"),
        }
    };
    (out, result)
}

/// Two-way request, bounded by [`TEST_TIMEOUT`].
pub async fn invoke(connection: &Arc<Connection>, operation: &str, params: &[u8]) -> Result<Vec<u8>, Error> {
    let (_out, result) = send(connection, operation, params, false);
    tokio::time::timeout(TEST_TIMEOUT, result)
        .await
        .expect("invocation timed out")
}

/// A complete frame ready to be injected with [`MemoryTransceiver::send_raw`].
pub fn raw_request(request_id: i32, operation: &str, params: &[u8]) -> Vec<u8> {
    let mut frame = request_frame(&RequestHeader::new("test", operation), params);
    frame[14..18].copy_from_slice(&request_id.to_be_bytes());
    prepare_frame(frame, false, 1)
}

/// Poll `condition` until it holds, panicking after [`TEST_TIMEOUT`].
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_finished(connection: &Arc<Connection>) {
    tokio::time::timeout(TEST_TIMEOUT, connection.wait_for_finished())
        .await
        .expect("connection did not finish");
}
