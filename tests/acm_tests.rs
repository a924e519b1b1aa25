//! Active connection management, run against the paused tokio clock.

mod common;

use common::*;
use floe::acm::{AcmClose, AcmConfig, AcmHeartbeat};
use floe::{Connection, ConnectionCallback, Error, State};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn acm(close: AcmClose, heartbeat: AcmHeartbeat) -> Option<AcmConfig> {
    Some(AcmConfig::new(Duration::from_secs(1), close, heartbeat))
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_closed_gracefully() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, server) = connected_pair(
        &instance,
        PairOptions {
            adapter: Some(servant.adapter()),
            client_acm: acm(AcmClose::OnIdle, AcmHeartbeat::Off),
            server_acm: None,
        },
    )
    .await;

    // Activity keeps it open.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        invoke(&client, "echo", b"").await.unwrap();
    }
    assert_eq!(client.state(), State::Active);

    wait_finished(&client).await;
    wait_finished(&server).await;
    assert_eq!(client.check_exception(), Err(Error::ConnectionTimeout));
    assert_eq!(server.check_exception(), Err(Error::CloseConnection));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_acm_never_closes() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = connected_pair(
        &instance,
        PairOptions {
            adapter: Some(servant.adapter()),
            client_acm: Some(AcmConfig::disabled()),
            server_acm: None,
        },
    )
    .await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(client.state(), State::Active);
    assert_eq!(client.acm(), AcmConfig::disabled());
}

#[derive(Default)]
struct HeartbeatCounter(AtomicUsize);

impl ConnectionCallback for HeartbeatCounter {
    fn heartbeat(&self, _connection: &Arc<Connection>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_peer_alive() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, server) = connected_pair(
        &instance,
        PairOptions {
            adapter: Some(servant.adapter()),
            client_acm: acm(AcmClose::Off, AcmHeartbeat::Always),
            server_acm: acm(AcmClose::OnIdle, AcmHeartbeat::Off),
        },
    )
    .await;
    let heartbeats = Arc::new(HeartbeatCounter::default());
    server.set_callback(Some(heartbeats.clone()));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(server.state(), State::Active);
    assert_eq!(client.state(), State::Active);
    assert!(heartbeats.0.load(Ordering::SeqCst) >= 4);
}

#[tokio::test(start_paused = true)]
async fn test_outstanding_invocation_closed_forcefully() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = connected_pair(
        &instance,
        PairOptions {
            adapter: Some(servant.adapter()),
            client_acm: acm(AcmClose::OnInvocation, AcmHeartbeat::Off),
            server_acm: None,
        },
    )
    .await;

    let (_out, reply) = send(&client, "slow", b"", false);
    assert_eq!(
        tokio::time::timeout(TEST_TIMEOUT, reply).await.unwrap(),
        Err(Error::ConnectionTimeout)
    );
    wait_finished(&client).await;
    assert_eq!(client.check_exception(), Err(Error::ConnectionTimeout));
}

#[tokio::test(start_paused = true)]
async fn test_per_connection_override() {
    let instance = test_instance();
    let servant = TestServant::new();
    let (client, _server) = connected_pair(
        &instance,
        PairOptions {
            adapter: Some(servant.adapter()),
            client_acm: acm(AcmClose::Off, AcmHeartbeat::Off),
            server_acm: None,
        },
    )
    .await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(client.state(), State::Active);

    client.set_acm(None, Some(AcmClose::OnIdle), None);
    assert_eq!(client.acm().close, AcmClose::OnIdle);
    assert_eq!(client.acm().timeout, Duration::from_secs(1));
    wait_finished(&client).await;
    assert_eq!(client.check_exception(), Err(Error::ConnectionTimeout));
}
