//! Connection behavior over in-memory transceivers.

mod common;

use common::*;
use floe::acm::{AcmClose, AcmConfig, AcmHeartbeat};
use floe::connection::ConnectionCallback;
use floe::observer::ConnectionObserver;
use floe::outgoing::{OutgoingAsync, Outcome};
use floe::protocol::header::{control_frame, encode_header, read_size};
use floe::protocol::{CompressionStatus, MessageType, RequestHeader};
use floe::transport::MemoryTransceiver;
use floe::{Connection, Endpoint, Error, Instance, State};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[tokio::test]
async fn test_request_reply_round_trip() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, server) = echo_pair(&instance, servant.adapter()).await;

    assert_eq!(client.state(), State::Active);
    assert_eq!(server.state(), State::Active);
    assert!(server.is_incoming());
    assert_eq!(server.info().adapter_name.as_deref(), Some("test"));

    let reply = invoke(&client, "echo", b"hello").await.unwrap();
    assert_eq!(reply, b"hello");
    assert_eq!(client.outstanding_requests(), 0);
    assert_eq!(servant.calls(), vec!["echo"]);
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = echo_pair(&instance, servant.adapter()).await;

    let mut pending = Vec::new();
    for i in 0..20u8 {
        let (_out, result) = send(&client, "echo", &[i; 3], false);
        pending.push((i, result));
    }
    for (i, result) in pending {
        assert_eq!(result.await.unwrap(), vec![i; 3]);
    }
}

#[tokio::test]
async fn test_compressed_request_round_trip() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = echo_pair(&instance, servant.adapter()).await;

    let payload: Vec<u8> = b"abcdefgh".iter().copied().cycle().take(4096).collect();
    let (_out, result) = send(&client, "echo", &payload, true);
    assert_eq!(result.await.unwrap(), payload);
}

#[tokio::test]
async fn test_oneway_completes_once_written() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = echo_pair(&instance, servant.adapter()).await;

    let (out, future) = OutgoingAsync::new(false);
    let frame = floe::protocol::message::request_frame(&RequestHeader::new("test", "ping"), b"");
    client.send_request(&out, frame, false, 0).unwrap();
    assert_eq!(future.await, Ok(Outcome::Sent));
    assert!(out.is_sent());
    assert_eq!(client.outstanding_requests(), 0);

    eventually("oneway dispatch", || servant.call_count() == 1).await;
}

#[tokio::test]
async fn test_batch_requests_dispatched_in_order() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = echo_pair(&instance, servant.adapter()).await;

    let mut queued = Vec::new();
    for operation in ["first", "second", "third"] {
        queued.push(
            client
                .queue_batch_request(&RequestHeader::new("test", operation), b"", false)
                .unwrap(),
        );
    }
    assert_eq!(client.batch_request_queue().len(), 3);
    assert_eq!(servant.call_count(), 0);

    let flushed = client.flush_batch_requests().unwrap();
    assert_eq!(flushed.await, Ok(Outcome::Sent));
    assert!(client.batch_request_queue().is_empty());
    for request in queued {
        assert_eq!(request.await, Ok(Outcome::Sent));
    }

    eventually("batch dispatch", || servant.call_count() == 3).await;
    assert_eq!(servant.calls(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_empty_batch_flush_completes_immediately() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = echo_pair(&instance, servant.adapter()).await;

    assert_eq!(client.flush_batch_requests().unwrap().await, Ok(Outcome::Sent));
}

#[tokio::test]
async fn test_dispatch_errors_map_to_replies() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, server) = echo_pair(&instance, servant.adapter()).await;

    match invoke(&client, "panic", b"").await {
        Err(Error::Unknown(reason)) => assert!(reason.contains("boom")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(
        invoke(&client, "fail", b"").await,
        Err(Error::UserException {
            payload: b"failed".to_vec()
        })
    );

    // The connection survives both.
    assert_eq!(server.state(), State::Active);
    assert_eq!(invoke(&client, "echo", b"ok").await.unwrap(), b"ok");
}

#[tokio::test]
async fn test_request_without_adapter_gets_object_not_exist() {
    let instance = test_instance();
    let (client, _server) = connected_pair(
        &instance,
        PairOptions {
            adapter: None,
            client_acm: None,
            server_acm: None,
        },
    )
    .await;

    match invoke(&client, "echo", b"").await {
        Err(Error::ObjectNotExist { identity, operation, .. }) => {
            assert_eq!(identity, "test");
            assert_eq!(operation, "echo");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_graceful_close_waits_for_outstanding_request() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, server) = echo_pair(&instance, servant.adapter()).await;

    let (_out, reply) = send(&client, "slow", b"late", false);
    eventually("slow dispatch", || servant.call_count() == 1).await;

    let closer = client.clone();
    let close = tokio::spawn(async move { closer.close_async(false).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), State::Active);
    assert!(!close.is_finished());

    servant.open_gate();
    assert_eq!(reply.await.unwrap(), b"late");
    tokio::time::timeout(TEST_TIMEOUT, close).await.unwrap().unwrap();

    wait_finished(&client).await;
    wait_finished(&server).await;
    assert_eq!(client.check_exception(), Err(Error::CloseConnection));
    assert_eq!(server.check_exception(), Err(Error::CloseConnection));
}

#[tokio::test]
async fn test_forceful_close_fails_outstanding_requests() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, server) = echo_pair(&instance, servant.adapter()).await;

    let (out, reply) = send(&client, "slow", b"", false);
    eventually("slow dispatch", || servant.call_count() == 1).await;

    client.close(true);
    assert_eq!(reply.await, Err(Error::ForcedClose));
    assert!(out.is_completed());
    wait_finished(&client).await;

    // The server notices the peer is gone; its pending reply is dropped.
    servant.open_gate();
    wait_finished(&server).await;
    assert!(matches!(server.check_exception(), Err(Error::ConnectionLost { .. })));
}

#[tokio::test]
async fn test_send_after_failure_is_retryable() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = echo_pair(&instance, servant.adapter()).await;

    client.close(true);
    match invoke(&client, "echo", b"").await {
        Err(Error::Retry(cause)) => assert_eq!(*cause, Error::ForcedClose),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(servant.call_count(), 0);
}

#[tokio::test]
async fn test_cancel_and_late_reply_complete_once() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = echo_pair(&instance, servant.adapter()).await;

    let (out, reply) = send(&client, "slow", b"", false);
    eventually("slow dispatch", || servant.call_count() == 1).await;

    client.cancel_request(&out, Error::InvocationCanceled);
    assert_eq!(reply.await, Err(Error::InvocationCanceled));
    assert_eq!(client.outstanding_requests(), 0);

    // The reply arrives for a request nobody waits for anymore.
    servant.open_gate();
    assert_eq!(invoke(&client, "echo", b"after").await.unwrap(), b"after");
    assert_eq!(client.state(), State::Active);
}

#[tokio::test]
async fn test_hold_defers_dispatch_until_activated() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, server) = echo_pair(&instance, servant.adapter()).await;

    server.hold();
    assert_eq!(server.state(), State::Holding);
    let (_out, reply) = send(&client, "echo", b"held", false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(servant.call_count(), 0);

    server.activate();
    assert_eq!(
        tokio::time::timeout(TEST_TIMEOUT, reply).await.unwrap().unwrap(),
        b"held"
    );
}

#[derive(Default)]
struct CallbackCounter {
    heartbeats: AtomicUsize,
    closed: AtomicUsize,
}

impl ConnectionCallback for CallbackCounter {
    fn heartbeat(&self, _connection: &Arc<Connection>) {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self, _connection: &Arc<Connection>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_heartbeat_and_closed_callbacks() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, server) = echo_pair(&instance, servant.adapter()).await;

    let callbacks = Arc::new(CallbackCounter::default());
    client.set_callback(Some(callbacks.clone()));

    server.heartbeat().unwrap();
    server.heartbeat().unwrap();
    eventually("heartbeats", || callbacks.heartbeats.load(Ordering::SeqCst) == 2).await;

    client.close(true);
    wait_finished(&client).await;
    assert_eq!(callbacks.closed.load(Ordering::SeqCst), 1);

    // Registering after close runs the callback right away.
    let late = Arc::new(CallbackCounter::default());
    client.set_callback(Some(late.clone()));
    assert_eq!(late.closed.load(Ordering::SeqCst), 1);
    assert!(client.heartbeat().is_err());
}

#[tokio::test]
async fn test_observer_sees_traffic_and_transitions() {
    let observer = Arc::new(CountingObserver::default());
    let instance = Instance::builder(floe::Config::for_testing())
        .observer(observer.clone())
        .build()
        .unwrap();
    let servant = TestServant::new();
    let (client, _server) = echo_pair(&instance, servant.adapter()).await;

    invoke(&client, "echo", b"observed").await.unwrap();
    assert!(observer.sent.load(Ordering::SeqCst) > 0);
    assert!(observer.received.load(Ordering::SeqCst) > 0);

    let transitions = observer.transitions.lock().clone();
    assert!(transitions.contains(&(State::NotInitialized, State::NotValidated)));
    assert!(transitions.contains(&(State::Holding, State::Active)));
}

/// A client connection whose peer is driven by hand.
async fn raw_client(instance: &Arc<Instance>) -> (Arc<Connection>, MemoryTransceiver) {
    let (a, b) = MemoryTransceiver::pair();
    let client = Connection::new(
        instance.clone(),
        Arc::new(a),
        Endpoint::memory("raw"),
        false,
        None,
        None,
    );
    b.send_raw(&control_frame(MessageType::ValidateConnection));
    tokio::time::timeout(TEST_TIMEOUT, client.start_async())
        .await
        .unwrap()
        .unwrap();
    client.activate();
    (client, b)
}

#[tokio::test]
async fn test_first_message_must_validate() {
    let instance = test_instance();
    let (a, b) = MemoryTransceiver::pair();
    let client = Connection::new(instance, Arc::new(a), Endpoint::memory("raw"), false, None, None);
    b.send_raw(&control_frame(MessageType::CloseConnection));

    let result = tokio::time::timeout(TEST_TIMEOUT, client.start_async()).await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionNotValidated { .. })));
    wait_finished(&client).await;
}

#[tokio::test]
async fn test_bad_magic_closes_connection() {
    let instance = test_instance();
    let (client, peer) = raw_client(&instance).await;

    let mut frame = control_frame(MessageType::ValidateConnection);
    frame[..4].copy_from_slice(b"HTTP");
    peer.send_raw(&frame);

    wait_finished(&client).await;
    assert_eq!(
        client.check_exception(),
        Err(Error::BadMagic {
            magic: *b"HTTP"
        })
    );
    assert!(peer.is_peer_closed());
}

#[tokio::test]
async fn test_oversized_message_closes_connection() {
    let instance = test_instance();
    let (client, peer) = raw_client(&instance).await;

    let size = instance.message_size_max() + 1;
    peer.send_raw(&encode_header(MessageType::Request, size, CompressionStatus::None));

    wait_finished(&client).await;
    assert!(matches!(
        client.check_exception(),
        Err(Error::MessageTooLarge { .. })
    ));
}

#[tokio::test]
async fn test_unknown_reply_is_discarded() {
    let instance = test_instance();
    let (client, peer) = raw_client(&instance).await;

    let frame = floe::protocol::compress::prepare_frame(
        floe::protocol::ReplyBody::Ok(b"x".to_vec()).encode(99),
        false,
        1,
    );
    peer.send_raw(&frame);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), State::Active);

    // A request the peer answers by hand still works.
    let (_out, reply) = send(&client, "echo", b"", false);
    eventually("request on the wire", || {
        peer.recv_available().iter().any(|bytes| !bytes.is_empty())
    })
    .await;
    let answer = floe::protocol::compress::prepare_frame(
        floe::protocol::ReplyBody::Ok(b"manual".to_vec()).encode(1),
        false,
        1,
    );
    peer.send_raw(&answer);
    assert_eq!(
        tokio::time::timeout(TEST_TIMEOUT, reply).await.unwrap().unwrap(),
        b"manual"
    );
}

#[tokio::test]
async fn test_peer_close_message_is_acknowledged() {
    let instance = test_instance();
    let (client, peer) = raw_client(&instance).await;

    peer.send_raw(&control_frame(MessageType::CloseConnection));
    wait_finished(&client).await;
    assert_eq!(client.check_exception(), Err(Error::CloseConnection));
    assert!(peer.is_peer_closed());
}

#[tokio::test]
async fn test_raw_request_is_dispatched_and_answered() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (a, b) = MemoryTransceiver::pair();
    let server = Connection::new(
        instance.clone(),
        Arc::new(b),
        Endpoint::memory("server"),
        true,
        None,
        Some(servant.adapter()),
    );
    tokio::time::timeout(TEST_TIMEOUT, server.start_async())
        .await
        .unwrap()
        .unwrap();
    server.activate();

    // The accepting side validates first.
    assert_eq!(
        a.recv_available().concat(),
        control_frame(MessageType::ValidateConnection)
    );

    a.send_raw(&raw_request(7, "echo", b"raw"));
    let mut received = Vec::new();
    eventually("reply", || {
        received.extend(a.recv_available().into_iter().flatten());
        received.len() >= 14 && received.len() as i64 >= read_size(&received)
    })
    .await;
    let reply = floe::Reply::decode(&received[14..]).unwrap();
    assert_eq!(reply.request_id, 7);
    assert_eq!(reply.into_result().unwrap(), b"raw");
}

#[tokio::test]
async fn test_queued_batch_requests_fail_when_connection_closes() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = echo_pair(&instance, servant.adapter()).await;

    let first = client
        .queue_batch_request(&RequestHeader::new("test", "first"), b"", false)
        .unwrap();
    let second = client
        .queue_batch_request(&RequestHeader::new("test", "second"), b"", false)
        .unwrap();

    client.close(true);
    assert_eq!(first.await, Err(Error::ForcedClose));
    assert_eq!(second.await, Err(Error::ForcedClose));
    assert!(client.batch_request_queue().is_empty());
    assert_eq!(
        client
            .queue_batch_request(&RequestHeader::new("test", "third"), b"", false)
            .err(),
        Some(Error::ForcedClose)
    );
    wait_finished(&client).await;
    assert_eq!(servant.call_count(), 0);
}

#[tokio::test]
async fn test_finished_connections_are_freed() {
    let instance = test_instance();
    let servant = TestServant::new();
    let acm = Some(AcmConfig::new(Duration::from_secs(60), AcmClose::Off, AcmHeartbeat::Off));
    let (client, server) = connected_pair(
        &instance,
        PairOptions {
            adapter: Some(servant.adapter()),
            client_acm: acm,
            server_acm: acm,
        },
    )
    .await;
    invoke(&client, "echo", b"").await.unwrap();

    client.close(true);
    wait_finished(&client).await;
    wait_finished(&server).await;

    let released: [Weak<Connection>; 2] = [Arc::downgrade(&client), Arc::downgrade(&server)];
    drop(client);
    drop(server);
    eventually("connections released", || {
        released.iter().all(|connection| connection.upgrade().is_none())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_start_and_waits() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (a, b) = MemoryTransceiver::pair();
    let server = Connection::new(
        instance.clone(),
        Arc::new(b),
        Endpoint::memory("server"),
        true,
        None,
        Some(servant.adapter()),
    );
    let client = Connection::new(instance.clone(), Arc::new(a), Endpoint::memory("client"), false, None, None);

    let starts = [client.clone(), server.clone()]
        .map(|connection| tokio::task::spawn_blocking(move || connection.start_and_wait()));
    for start in starts {
        tokio::time::timeout(TEST_TIMEOUT, start)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
    assert_eq!(client.state(), State::Holding);
    assert_eq!(server.state(), State::Holding);

    let holding = client.clone();
    tokio::time::timeout(TEST_TIMEOUT, tokio::task::spawn_blocking(move || holding.wait_until_holding()))
        .await
        .unwrap()
        .unwrap();

    client.activate();
    server.activate();
    assert_eq!(invoke(&client, "echo", b"sync").await.unwrap(), b"sync");

    client.close(true);
    let finishing = client.clone();
    tokio::time::timeout(TEST_TIMEOUT, tokio::task::spawn_blocking(move || finishing.wait_until_finished()))
        .await
        .unwrap()
        .unwrap();
    assert!(client.is_finished());
    assert_eq!(client.check_exception(), Err(Error::ForcedClose));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_graceful_close_waits_for_outstanding_request() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, server) = echo_pair(&instance, servant.adapter()).await;

    let (_out, reply) = send(&client, "slow", b"late", false);
    eventually("slow dispatch", || servant.call_count() == 1).await;

    let closer = client.clone();
    let close = tokio::task::spawn_blocking(move || closer.close(false));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), State::Active);
    assert!(!close.is_finished());

    servant.open_gate();
    assert_eq!(reply.await.unwrap(), b"late");
    tokio::time::timeout(TEST_TIMEOUT, close).await.unwrap().unwrap();

    wait_finished(&client).await;
    wait_finished(&server).await;
    assert_eq!(client.check_exception(), Err(Error::CloseConnection));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_reply_and_forced_close_race() {
    let instance = test_instance();
    let servant = TestServant::new();

    for round in 0..200 {
        let (client, _server) = echo_pair(&instance, servant.adapter()).await;
        let (out, reply) = send(&client, "echo", b"race", false);

        let canceler = {
            let (client, out) = (client.clone(), out.clone());
            tokio::spawn(async move { client.cancel_request(&out, Error::InvocationCanceled) })
        };
        let closer = {
            let client = client.clone();
            tokio::spawn(async move { client.close(true) })
        };

        let result = tokio::time::timeout(TEST_TIMEOUT, reply)
            .await
            .unwrap_or_else(|_| panic!("round {}: request never completed", round));
        match result {
            Ok(params) => assert_eq!(params, b"race"),
            Err(Error::InvocationCanceled) | Err(Error::ForcedClose) => {}
            other => panic!("round {}: unexpected result {:?}", round, other),
        }
        canceler.await.unwrap();
        closer.await.unwrap();

        // Whatever won, the record is completed and stays that way.
        assert!(out.is_completed());
        assert!(!out.complete(Err(Error::ForcedClose)));
        wait_finished(&client).await;
        assert_eq!(client.outstanding_requests(), 0);
    }
}

/// Records transitions per connection.
#[derive(Default)]
struct TransitionLog(Mutex<HashMap<String, Vec<(State, State)>>>);

impl ConnectionObserver for TransitionLog {
    fn state_changed(&self, connection: &str, old: State, new: State) {
        self.0.lock().entry(connection.to_string()).or_default().push((old, new));
    }
}

impl TransitionLog {
    /// Connections whose last reported state is `Finished`.
    fn finished(&self) -> usize {
        self.0
            .lock()
            .values()
            .filter(|transitions| transitions.last().is_some_and(|&(_, new)| new == State::Finished))
            .count()
    }

    fn assert_forward_only(&self) {
        let log = self.0.lock();
        assert_eq!(log.len(), 2);
        for (connection, transitions) in log.iter() {
            let mut current = State::NotInitialized;
            for &(old, new) in transitions {
                assert_eq!(old, current, "{}: {:?}", connection, transitions);
                let toggled = matches!((old, new), (State::Active, State::Holding) | (State::Holding, State::Active));
                assert!(new > old || toggled, "{}: {:?}", connection, transitions);
                current = new;
            }
            assert_eq!(current, State::Finished, "{}: {:?}", connection, transitions);
        }
    }
}

async fn observed_pair(log: &Arc<TransitionLog>, servant: &Arc<TestServant>) -> (Arc<Connection>, Arc<Connection>) {
    let instance = Instance::builder(floe::Config::for_testing())
        .observer(log.clone())
        .build()
        .unwrap();
    echo_pair(&instance, servant.adapter()).await
}

#[tokio::test]
async fn test_state_only_moves_forward() {
    let servant = TestServant::new();

    // Graceful close after a hold and an activate.
    let log = Arc::new(TransitionLog::default());
    let (client, server) = observed_pair(&log, &servant).await;
    server.hold();
    server.activate();
    invoke(&client, "echo", b"").await.unwrap();
    client.close_async(false).await;
    wait_finished(&client).await;
    wait_finished(&server).await;
    for connection in [&client, &server] {
        assert!(connection.check_exception().is_err());
    }
    eventually("final transitions", || log.finished() == 2).await;
    log.assert_forward_only();

    // Forced close with a request outstanding.
    let servant = TestServant::new();
    let log = Arc::new(TransitionLog::default());
    let (client, server) = observed_pair(&log, &servant).await;
    let (_out, reply) = send(&client, "slow", b"", false);
    eventually("slow dispatch", || servant.call_count() == 1).await;
    client.close(true);
    assert_eq!(reply.await, Err(Error::ForcedClose));
    servant.open_gate();
    wait_finished(&client).await;
    wait_finished(&server).await;
    for connection in [&client, &server] {
        assert!(connection.check_exception().is_err());
    }
    eventually("final transitions", || log.finished() == 2).await;
    log.assert_forward_only();
}

/// Observer that looks at the connection it is told about.
#[derive(Default)]
struct ReentrantObserver {
    connection: Mutex<Weak<Connection>>,
    seen: Mutex<Vec<State>>,
}

impl ConnectionObserver for ReentrantObserver {
    fn state_changed(&self, _connection: &str, _old: State, _new: State) {
        let connection = self.connection.lock().upgrade();
        if let Some(connection) = connection {
            let state = connection.state();
            self.seen.lock().push(state);
        }
    }

    fn sent_bytes(&self, _connection: &str, _count: usize) {
        let connection = self.connection.lock().upgrade();
        if let Some(connection) = connection {
            connection.outstanding_requests();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_observer_may_call_back_into_connection() {
    let observer = Arc::new(ReentrantObserver::default());
    let instance = Instance::builder(floe::Config::for_testing())
        .observer(observer.clone())
        .build()
        .unwrap();
    let servant = TestServant::new();
    let (client, server) = echo_pair(&instance, servant.adapter()).await;
    *observer.connection.lock() = Arc::downgrade(&client);

    assert_eq!(invoke(&client, "echo", b"again").await.unwrap(), b"again");
    let closer = client.clone();
    tokio::time::timeout(TEST_TIMEOUT, tokio::task::spawn_blocking(move || closer.close(true)))
        .await
        .unwrap()
        .unwrap();
    wait_finished(&client).await;
    wait_finished(&server).await;
    eventually("observer saw the finished state", || {
        observer.seen.lock().contains(&State::Finished)
    })
    .await;
}
