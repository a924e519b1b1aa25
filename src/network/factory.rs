//! Outgoing connections, shared per endpoint.

use crate::acm::ConnectionMonitor;
use crate::connection::{Connection, DestroyReason};
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::network::{Endpoint, Transport};
use crate::transport::{TcpTransceiver, Transceiver, UdpTransceiver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, instrument};

#[derive(Default)]
struct FactoryInner {
    connections: HashMap<Endpoint, Vec<Arc<Connection>>>,
    destroyed: bool,
}

/// Connects to endpoints and hands out established connections.
///
/// An active connection to an endpoint is reused by every caller until it
/// closes; finished connections are reaped through the ACM monitor.
pub struct OutgoingConnectionFactory {
    instance: Arc<Instance>,
    monitor: Arc<ConnectionMonitor>,
    inner: Mutex<FactoryInner>,
}

impl OutgoingConnectionFactory {
    pub fn new(instance: Arc<Instance>) -> Arc<Self> {
        let monitor = ConnectionMonitor::new(instance.client_acm(), instance.timer().clone());
        Arc::new(Self {
            instance,
            monitor,
            inner: Mutex::new(FactoryInner::default()),
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    /// An active connection to `endpoint`, connecting if there is none.
    #[instrument(level = "debug", skip(self), fields(endpoint = %endpoint))]
    pub async fn create(&self, endpoint: &Endpoint) -> Result<Arc<Connection>> {
        if let Some(connection) = self.find(endpoint)? {
            return Ok(connection);
        }

        let transceiver = self.connect(endpoint).await?;
        let connection = Connection::new(
            self.instance.clone(),
            transceiver,
            endpoint.clone(),
            false,
            Some(self.monitor.clone()),
            None,
        );
        if let Err(e) = connection.start_async().await {
            debug!(endpoint = %endpoint, error = %e, "Connection establishment failed");
            return Err(e);
        }
        connection.activate();

        let mut inner = self.inner.lock();
        if inner.destroyed {
            connection.destroy(DestroyReason::RuntimeDestroyed);
            return Err(Error::RuntimeDestroyed);
        }
        inner
            .connections
            .entry(endpoint.clone())
            .or_default()
            .push(connection.clone());
        info!(connection = %connection.description(), "Connected to {}", endpoint);
        Ok(connection)
    }

    fn find(&self, endpoint: &Endpoint) -> Result<Option<Arc<Connection>>> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::RuntimeDestroyed);
        }
        Self::reap(&mut inner, &self.monitor);
        Ok(inner
            .connections
            .get(endpoint)
            .and_then(|list| list.iter().find(|c| c.is_active_or_holding()).cloned()))
    }

    fn reap(inner: &mut FactoryInner, monitor: &ConnectionMonitor) {
        for reaped in monitor.swap_reaped_connections() {
            if let Some(list) = inner.connections.get_mut(reaped.endpoint()) {
                list.retain(|c| !Arc::ptr_eq(c, &reaped));
            }
        }
        inner.connections.retain(|_, list| {
            list.retain(|c| !c.is_finished());
            !list.is_empty()
        });
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transceiver>> {
        let timeout = self.instance.connect_timeout().unwrap_or(endpoint.timeout);
        let address = endpoint.address();
        let connect_failed = |e: std::io::Error| Error::ConnectFailed {
            address: address.clone(),
            reason: e.to_string(),
        };

        match endpoint.transport {
            Transport::Tcp => {
                let stream = with_timeout(timeout, TcpStream::connect(&address))
                    .await?
                    .map_err(connect_failed)?;
                Ok(Arc::new(TcpTransceiver::new(stream)))
            }
            Transport::Udp => {
                let bind = if endpoint.host.contains(':') { "[::]:0" } else { "0.0.0.0:0" };
                let socket = UdpSocket::bind(bind).await.map_err(connect_failed)?;
                socket.connect(&address).await.map_err(connect_failed)?;
                Ok(Arc::new(UdpTransceiver::connected(socket)))
            }
            Transport::Memory => Err(Error::NoEndpoint {
                reason: format!("{} cannot be connected to", endpoint),
            }),
        }
    }

    /// Flush the batch queues of every active connection.
    pub async fn flush_batch_requests(&self) -> Result<()> {
        let connections: Vec<_> = {
            let inner = self.inner.lock();
            inner.connections.values().flatten().cloned().collect()
        };
        for connection in connections {
            if connection.is_active_or_holding() {
                connection.flush_batch_requests()?.await?;
            }
        }
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::reap(&mut inner, &self.monitor);
        inner.connections.values().map(Vec::len).sum()
    }

    /// Close every connection; later [`create`](Self::create) calls fail.
    pub fn destroy(&self) {
        let connections: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.connections.values().flatten().cloned().collect()
        };
        debug!(count = connections.len(), "Destroying outgoing connections");
        for connection in connections {
            connection.destroy(DestroyReason::RuntimeDestroyed);
        }
    }

    /// Wait for every connection closed by [`destroy`](Self::destroy).
    pub async fn wait_until_finished(&self) {
        let connections: Vec<_> = {
            let inner = self.inner.lock();
            inner.connections.values().flatten().cloned().collect()
        };
        for connection in &connections {
            connection.wait_for_finished().await;
        }
        let mut inner = self.inner.lock();
        inner.connections.clear();
        self.monitor.destroy();
    }
}

async fn with_timeout<F: std::future::Future>(
    timeout: Option<Duration>,
    future: F,
) -> Result<F::Output> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| Error::ConnectTimeout { timeout }),
        None => Ok(future.await),
    }
}
