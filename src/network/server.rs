//! Incoming connections for one adapter.

use crate::acm::ConnectionMonitor;
use crate::connection::{Connection, DestroyReason};
use crate::dispatch::Adapter;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::network::{Endpoint, Transport};
use crate::transport::{TcpTransceiver, UdpTransceiver};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// Pause after a failed accept, so a persistent error such as running out
/// of file descriptors does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FactoryState {
    Holding,
    Active,
    Closed,
}

struct ServerInner {
    state: FactoryState,
    connections: Vec<Arc<Connection>>,
    accept_task: Option<JoinHandle<()>>,
}

/// Accepts connections on an endpoint and binds them to an [`Adapter`].
///
/// New factories start out holding: connections are accepted and validated
/// but requests are not read until [`activate`](Self::activate).
pub struct IncomingConnectionFactory {
    instance: Arc<Instance>,
    adapter: Adapter,
    endpoint: Endpoint,
    monitor: Arc<ConnectionMonitor>,
    inner: Mutex<ServerInner>,
    this: Weak<IncomingConnectionFactory>,
}

impl IncomingConnectionFactory {
    /// Bind `endpoint`. Port 0 picks a free port, see [`endpoint`](Self::endpoint).
    #[instrument(level = "debug", skip(instance, adapter), fields(endpoint = %endpoint, adapter = %adapter.name()))]
    pub async fn bind(
        instance: Arc<Instance>,
        endpoint: Endpoint,
        adapter: Adapter,
    ) -> Result<Arc<Self>> {
        let address = endpoint.address();
        let bind_failed = |e: std::io::Error| Error::from_io(&e, &format!("bind to {}", address));
        let monitor = ConnectionMonitor::new(instance.server_acm(), instance.timer().clone());

        match endpoint.transport {
            Transport::Tcp => {
                let listener = TcpListener::bind(&address).await.map_err(bind_failed)?;
                let mut endpoint = endpoint;
                if let Ok(local) = listener.local_addr() {
                    endpoint.port = local.port();
                }
                info!("Listening for tcp connections on {}", endpoint);

                let factory = Self::build(instance, endpoint, adapter, monitor);
                let listener = Arc::new(listener);
                let accept = move || {
                    let listener = listener.clone();
                    async move { listener.accept().await }
                };
                let task = factory
                    .instance
                    .timer()
                    .spawn(accept_loop(accept, Arc::downgrade(&factory)));
                factory.inner.lock().accept_task = Some(task);
                Ok(factory)
            }
            Transport::Udp => {
                let socket = UdpSocket::bind(&address).await.map_err(bind_failed)?;
                let mut endpoint = endpoint;
                if let Ok(local) = socket.local_addr() {
                    endpoint.port = local.port();
                }
                info!("Listening for udp datagrams on {}", endpoint);

                let factory = Self::build(instance, endpoint, adapter, monitor);
                let connection = factory.new_connection(Arc::new(UdpTransceiver::bound(socket)));
                factory.start(connection);
                Ok(factory)
            }
            Transport::Memory => Err(Error::NoEndpoint {
                reason: format!("{} cannot be bound", endpoint),
            }),
        }
    }

    fn build(
        instance: Arc<Instance>,
        endpoint: Endpoint,
        adapter: Adapter,
        monitor: Arc<ConnectionMonitor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            instance,
            adapter,
            endpoint,
            monitor,
            inner: Mutex::new(ServerInner {
                state: FactoryState::Holding,
                connections: Vec::new(),
                accept_task: None,
            }),
            this: this.clone(),
        })
    }

    /// The bound endpoint, with the port actually in use.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn new_connection(&self, transceiver: Arc<dyn crate::transport::Transceiver>) -> Arc<Connection> {
        Connection::new(
            self.instance.clone(),
            transceiver,
            self.endpoint.clone(),
            true,
            Some(self.monitor.clone()),
            Some(self.adapter.clone()),
        )
    }

    /// Track `connection` and run its handshake in the background.
    fn start(&self, connection: Arc<Connection>) {
        {
            let mut inner = self.inner.lock();
            if inner.state == FactoryState::Closed {
                drop(inner);
                connection.destroy(DestroyReason::AdapterDeactivated);
                return;
            }
            Self::reap(&mut inner, &self.monitor);
            inner.connections.push(connection.clone());
        }

        let this = self.this.clone();
        self.instance.timer().spawn(async move {
            match connection.start_async().await {
                Ok(()) => {
                    let Some(factory) = this.upgrade() else {
                        return;
                    };
                    let state = factory.inner.lock().state;
                    match state {
                        FactoryState::Active => connection.activate(),
                        FactoryState::Holding => {}
                        FactoryState::Closed => connection.destroy(DestroyReason::AdapterDeactivated),
                    }
                }
                Err(e) => {
                    debug!(connection = %connection.description(), error = %e, "Incoming connection failed to start");
                }
            }
        });
    }

    /// Start reading requests on every connection.
    pub fn activate(&self) {
        let connections = {
            let mut inner = self.inner.lock();
            if inner.state != FactoryState::Holding {
                return;
            }
            inner.state = FactoryState::Active;
            inner.connections.clone()
        };
        debug!(endpoint = %self.endpoint, "Activating incoming connections");
        for connection in connections {
            connection.activate();
        }
    }

    /// Stop reading requests; connections stay open.
    pub fn hold(&self) {
        let connections = {
            let mut inner = self.inner.lock();
            if inner.state != FactoryState::Active {
                return;
            }
            inner.state = FactoryState::Holding;
            inner.connections.clone()
        };
        debug!(endpoint = %self.endpoint, "Holding incoming connections");
        for connection in connections {
            connection.hold();
        }
    }

    /// Stop accepting and gracefully close every connection.
    pub fn destroy(&self) {
        let connections = {
            let mut inner = self.inner.lock();
            if inner.state == FactoryState::Closed {
                return;
            }
            inner.state = FactoryState::Closed;
            if let Some(task) = inner.accept_task.take() {
                task.abort();
            }
            inner.connections.clone()
        };
        info!(endpoint = %self.endpoint, count = connections.len(), "Deactivating adapter `{}`", self.adapter.name());
        for connection in connections {
            connection.destroy(DestroyReason::AdapterDeactivated);
        }
    }

    /// Wait until every connection has finished after [`destroy`](Self::destroy).
    pub async fn wait_until_finished(&self) {
        let connections = self.inner.lock().connections.clone();
        for connection in &connections {
            connection.wait_for_finished().await;
        }
        self.inner.lock().connections.clear();
        self.monitor.destroy();
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        Self::reap(&mut inner, &self.monitor);
        inner.connections.clone()
    }

    /// Forget connections that finished.
    fn reap(inner: &mut ServerInner, monitor: &ConnectionMonitor) {
        let reaped = monitor.swap_reaped_connections();
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "Reaped finished incoming connections");
        }
        inner
            .connections
            .retain(|c| !c.is_finished() && !reaped.iter().any(|r| Arc::ptr_eq(r, c)));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == FactoryState::Closed
    }
}

async fn accept_loop<A, F>(mut accept: A, factory: Weak<IncomingConnectionFactory>)
where
    A: FnMut() -> F,
    F: Future<Output = std::io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let accepted = accept().await;
        let Some(factory) = factory.upgrade() else {
            break;
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                debug!(%peer_addr, "Accepted tcp connection");
                let connection = factory.new_connection(Arc::new(TcpTransceiver::new(stream)));
                factory.start(connection);
            }
            Err(e) => {
                if factory.is_closed() {
                    break;
                }
                error!(error = %e, "Failed to accept connection");
                drop(factory);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
    debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatch::{DispatchOutcome, IncomingRequest};
    use crate::protocol::ReplyBody;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn idle_adapter() -> Adapter {
        Adapter::new(
            "idle",
            Arc::new(|_request: IncomingRequest| -> Result<DispatchOutcome> {
                Ok(DispatchOutcome::Reply(ReplyBody::Ok(Vec::new())))
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off() {
        let instance = Instance::with_config(Config::for_testing()).unwrap();
        let monitor = ConnectionMonitor::new(instance.server_acm(), instance.timer().clone());
        let factory = IncomingConnectionFactory::build(
            instance,
            Endpoint::tcp("127.0.0.1", 0),
            idle_adapter(),
            monitor,
        );

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let accept = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(TcpStream, SocketAddr), _>(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "too many open files",
                ))
            }
        };
        let task = tokio::spawn(accept_loop(accept, Arc::downgrade(&factory)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let count = attempts.load(Ordering::SeqCst);
        assert!((2..=25).contains(&count), "{} accept attempts in one second", count);

        factory.destroy();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
