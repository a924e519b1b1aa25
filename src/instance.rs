//! Runtime-wide settings and services shared by every connection.

use crate::acm::AcmConfig;
use crate::batch::BatchRequestInterceptor;
use crate::config::Config;
use crate::error::Result;
use crate::observer::ConnectionObserver;
use crate::protocol::compress::clamp_level;
use crate::timer::Timer;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Settings resolved from [`Config`] plus the shared timer and hooks.
#[derive(Clone)]
pub struct Instance {
    config: Config,
    timer: Timer,
    observer: Option<Arc<dyn ConnectionObserver>>,
    batch_interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("config", &self.config)
            .field("observer", &self.observer.is_some())
            .field("batch_interceptor", &self.batch_interceptor.is_some())
            .finish()
    }
}

impl Instance {
    /// Validate `config` and bind the instance to `timer`'s runtime.
    pub fn new(config: Config, timer: Timer) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            timer,
            observer: None,
            batch_interceptor: None,
        }))
    }

    /// Same as [`Instance::new`], on the current tokio runtime.
    pub fn with_config(config: Config) -> Result<Arc<Self>> {
        Self::new(config, Timer::current())
    }

    pub fn builder(config: Config) -> InstanceBuilder {
        InstanceBuilder {
            config,
            timer: None,
            observer: None,
            batch_interceptor: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn observer(&self) -> Option<&Arc<dyn ConnectionObserver>> {
        self.observer.as_ref()
    }

    pub fn batch_interceptor(&self) -> Option<Arc<dyn BatchRequestInterceptor>> {
        self.batch_interceptor.clone()
    }

    pub fn message_size_max(&self) -> usize {
        self.config.message_size_max
    }

    /// Configured compression level, clamped to 1..=9.
    pub fn compression_level(&self) -> i32 {
        i32::from(clamp_level(self.config.compression_level))
    }

    pub fn batch_auto_flush_size(&self) -> usize {
        self.config.batch_auto_flush_size
    }

    pub fn client_acm(&self) -> AcmConfig {
        self.config.client_acm()
    }

    pub fn server_acm(&self) -> AcmConfig {
        self.config.server_acm()
    }

    pub fn endpoint_timeout(&self) -> Option<Duration> {
        self.config.endpoint_timeout()
    }

    pub fn connect_timeout(&self) -> Option<Option<Duration>> {
        self.config.connect_timeout_override()
    }

    pub fn close_timeout(&self) -> Option<Option<Duration>> {
        self.config.close_timeout_override()
    }

    pub fn retry_intervals(&self) -> Vec<Duration> {
        self.config.retry_delays()
    }

    pub fn warn_connections(&self) -> bool {
        self.config.warn_connections
    }

    pub fn warn_datagrams(&self) -> bool {
        self.config.warn_datagrams
    }
}

pub struct InstanceBuilder {
    config: Config,
    timer: Option<Timer>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    batch_interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
}

impl InstanceBuilder {
    pub fn timer(mut self, timer: Timer) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn batch_interceptor(mut self, interceptor: Arc<dyn BatchRequestInterceptor>) -> Self {
        self.batch_interceptor = Some(interceptor);
        self
    }

    /// Without an explicit timer this must run inside a tokio runtime.
    pub fn build(self) -> Result<Arc<Instance>> {
        self.config.validate()?;
        Ok(Arc::new(Instance {
            config: self.config,
            timer: self.timer.unwrap_or_else(Timer::current),
            observer: self.observer,
            batch_interceptor: self.batch_interceptor,
        }))
    }
}
