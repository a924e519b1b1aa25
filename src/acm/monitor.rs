//! Registry of active connections checked on a periodic tick.

use crate::acm::{AcmClose, AcmConfig, AcmHeartbeat};
use crate::connection::Connection;
use crate::timer::{Timer, TimerTask};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Default)]
struct MonitorInner {
    connections: HashMap<u64, Weak<Connection>>,
    reaped: Vec<Arc<Connection>>,
    task: Option<TimerTask>,
    destroyed: bool,
}

/// Ticks every `timeout / 2` and lets each registered connection apply the
/// ACM policy. Connections hold the monitor, the monitor only holds weak
/// references back.
pub struct ConnectionMonitor {
    config: AcmConfig,
    timer: Timer,
    parent: Option<Arc<ConnectionMonitor>>,
    inner: Mutex<MonitorInner>,
    this: Weak<ConnectionMonitor>,
}

impl fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("config", &self.config)
            .field("connections", &self.inner.lock().connections.len())
            .field("child", &self.parent.is_some())
            .finish()
    }
}

impl ConnectionMonitor {
    pub fn new(config: AcmConfig, timer: Timer) -> Arc<Self> {
        Self::build(config, timer, None)
    }

    fn build(config: AcmConfig, timer: Timer, parent: Option<Arc<ConnectionMonitor>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            timer,
            parent,
            inner: Mutex::new(MonitorInner::default()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> AcmConfig {
        self.config
    }

    /// Interval between two ticks.
    pub fn tick_period(&self) -> Duration {
        (self.config.timeout / 2).max(Duration::from_millis(1))
    }

    /// Start watching an active connection.
    pub fn add(&self, connection: &Arc<Connection>) {
        if !self.config.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        inner
            .connections
            .insert(connection.id(), Arc::downgrade(connection));
        if inner.task.is_none() {
            let monitor = self.this.clone();
            let period = self.tick_period();
            debug!(timeout_secs = self.config.timeout.as_secs(), "Starting connection monitor");
            inner.task = Some(self.timer.schedule_repeated(period, move || {
                if let Some(monitor) = monitor.upgrade() {
                    monitor.tick();
                }
            }));
        }
    }

    pub fn remove(&self, connection_id: u64) {
        if !self.config.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.connections.remove(&connection_id);
        if inner.connections.is_empty() {
            if let Some(task) = inner.task.take() {
                task.cancel();
            }
        }
    }

    /// Hand a finished connection to whoever owns the connection registry.
    /// A destroyed monitor has no owner left and drops it.
    pub fn reap(&self, connection: Arc<Connection>) {
        match &self.parent {
            Some(parent) => parent.reap(connection),
            None => {
                let mut inner = self.inner.lock();
                if !inner.destroyed {
                    inner.reaped.push(connection);
                }
            }
        }
    }

    /// Take the connections reaped since the last call.
    pub fn swap_reaped_connections(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut self.inner.lock().reaped)
    }

    /// Monitor with some settings overridden, reaping into this one.
    pub fn acm(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        close: Option<AcmClose>,
        heartbeat: Option<AcmHeartbeat>,
    ) -> Arc<ConnectionMonitor> {
        let config = self.config.with_overrides(timeout, close, heartbeat);
        let root = match &self.parent {
            Some(parent) => parent.clone(),
            None => self.clone(),
        };
        Self::build(config, self.timer.clone(), Some(root))
    }

    pub fn destroy(&self) {
        let reaped = {
            let mut inner = self.inner.lock();
            inner.destroyed = true;
            inner.connections.clear();
            if let Some(task) = inner.task.take() {
                task.cancel();
            }
            std::mem::take(&mut inner.reaped)
        };
        // Dropped outside the lock: a connection may be released here.
        drop(reaped);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }

    fn tick(&self) {
        // Connections are checked without the monitor lock: they call back
        // into `remove` when the check closes them.
        let connections: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock();
            inner.connections.retain(|_, weak| weak.strong_count() > 0);
            inner.connections.values().filter_map(Weak::upgrade).collect()
        };
        if connections.is_empty() {
            return;
        }
        trace!(count = connections.len(), "Connection monitor tick");
        let now = Instant::now();
        for connection in connections {
            connection.monitor(now, &self.config);
        }
    }
}
