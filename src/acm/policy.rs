//! The ACM decision table, free of clocks and locks.

use crate::acm::{AcmClose, AcmConfig, AcmHeartbeat};
use std::time::Duration;

/// What the monitor observed about a connection at tick time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcmSnapshot {
    /// Time since the last fully read or written message.
    pub idle: Duration,
    /// A frame is queued or partially written.
    pub write_pending: bool,
    /// A frame body is partially read.
    pub read_in_progress: bool,
    pub dispatch_count: usize,
    pub outstanding_requests: bool,
    pub batch_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    None,
    /// Enter `Closing` with a connection timeout.
    Graceful,
    /// Enter `Closed` with a connection timeout.
    Forceful,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcmDecision {
    pub heartbeat: bool,
    pub close: CloseAction,
}

/// Decide what one monitor tick does to an active connection.
pub fn evaluate(config: &AcmConfig, snapshot: &AcmSnapshot) -> AcmDecision {
    // Heartbeat after a quarter of the timeout: the monitor only ticks every
    // half timeout, so waiting longer could let the peer time out first.
    let heartbeat = (config.heartbeat == AcmHeartbeat::Always
        || (config.heartbeat != AcmHeartbeat::Off
            && !snapshot.write_pending
            && snapshot.idle >= config.timeout / 4))
        && (config.heartbeat != AcmHeartbeat::OnDispatch || snapshot.dispatch_count > 0);

    // Mid-frame I/O is covered by the read/write timeouts.
    if snapshot.read_in_progress || snapshot.write_pending {
        return AcmDecision {
            heartbeat,
            close: CloseAction::None,
        };
    }

    let close = if config.close != AcmClose::Off && snapshot.idle >= config.timeout {
        if config.close == AcmClose::OnIdleForceful
            || (config.close != AcmClose::OnIdle && snapshot.outstanding_requests)
        {
            CloseAction::Forceful
        } else if config.close != AcmClose::OnInvocation
            && snapshot.dispatch_count == 0
            && snapshot.batch_empty
            && !snapshot.outstanding_requests
        {
            CloseAction::Graceful
        } else {
            CloseAction::None
        }
    } else {
        CloseAction::None
    };

    AcmDecision { heartbeat, close }
}
