//! Active connection management: idle timeouts and heartbeats.

pub mod monitor;
pub mod policy;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use monitor::ConnectionMonitor;
pub use policy::{evaluate, AcmDecision, AcmSnapshot, CloseAction};

/// When an idle connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcmClose {
    Off,
    /// Gracefully close idle connections that have no pending work.
    OnIdle,
    /// Forcefully close connections whose outstanding requests got no
    /// activity within the timeout.
    OnInvocation,
    OnInvocationAndIdle,
    /// Forcefully close any idle connection.
    OnIdleForceful,
}

/// When heartbeats are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcmHeartbeat {
    Off,
    /// Only while a dispatch is in progress.
    OnDispatch,
    OnIdle,
    Always,
}

impl fmt::Display for AcmClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcmClose::Off => "off",
            AcmClose::OnIdle => "on-idle",
            AcmClose::OnInvocation => "on-invocation",
            AcmClose::OnInvocationAndIdle => "on-invocation-and-idle",
            AcmClose::OnIdleForceful => "on-idle-forceful",
        };
        f.write_str(name)
    }
}

impl fmt::Display for AcmHeartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcmHeartbeat::Off => "off",
            AcmHeartbeat::OnDispatch => "on-dispatch",
            AcmHeartbeat::OnIdle => "on-idle",
            AcmHeartbeat::Always => "always",
        };
        f.write_str(name)
    }
}

/// Immutable ACM policy. A zero timeout disables monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcmConfig {
    pub timeout: Duration,
    pub close: AcmClose,
    pub heartbeat: AcmHeartbeat,
}

impl AcmConfig {
    pub fn new(timeout: Duration, close: AcmClose, heartbeat: AcmHeartbeat) -> Self {
        Self {
            timeout,
            close,
            heartbeat,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, AcmClose::Off, AcmHeartbeat::Off)
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// Apply per-connection overrides on top of this policy.
    pub fn with_overrides(
        &self,
        timeout: Option<Duration>,
        close: Option<AcmClose>,
        heartbeat: Option<AcmHeartbeat>,
    ) -> Self {
        Self {
            timeout: timeout.unwrap_or(self.timeout),
            close: close.unwrap_or(self.close),
            heartbeat: heartbeat.unwrap_or(self.heartbeat),
        }
    }
}

impl Default for AcmConfig {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(60),
            AcmClose::OnInvocationAndIdle,
            AcmHeartbeat::OnDispatch,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_keep_unset_fields() {
        let base = AcmConfig::default();
        let merged = base.with_overrides(Some(Duration::from_secs(5)), None, Some(AcmHeartbeat::Always));
        assert_eq!(merged.timeout, Duration::from_secs(5));
        assert_eq!(merged.close, AcmClose::OnInvocationAndIdle);
        assert_eq!(merged.heartbeat, AcmHeartbeat::Always);
    }

    #[test]
    fn test_zero_timeout_disables() {
        assert!(!AcmConfig::disabled().is_enabled());
        assert!(AcmConfig::default().is_enabled());
    }
}
