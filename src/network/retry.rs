use crate::error::Error;
use crate::instance::Instance;
use crate::protocol::OperationMode;
use std::time::Duration;

/// Decides whether a failed invocation is sent again.
///
/// A request whose bytes may have reached the peer is only resent when the
/// failure says the peer did not act on it, or when the operation is
/// idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
}

impl RetryPolicy {
    /// One retry per interval, each after its delay.
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    pub fn from_instance(instance: &Instance) -> Self {
        Self::new(instance.retry_intervals())
    }

    pub fn never() -> Self {
        Self::new(Vec::new())
    }

    pub fn max_retries(&self) -> usize {
        self.intervals.len()
    }

    /// Delay before retry number `attempt` (starting at 0), or `None` if the
    /// error must be reported to the caller.
    pub fn check_retry_after_exception(
        &self,
        error: &Error,
        sent: bool,
        mode: OperationMode,
        attempt: usize,
    ) -> Option<Duration> {
        if !Self::is_retryable(error, sent, mode) {
            return None;
        }
        self.intervals.get(attempt).copied()
    }

    fn is_retryable(error: &Error, sent: bool, mode: OperationMode) -> bool {
        if error.is_retryable_before_send() || error.is_retry_safe() {
            return true;
        }
        if error.is_terminal_for_caller() {
            return false;
        }
        match error {
            // The peer ran the operation and answered.
            Error::UserException { .. }
            | Error::FacetNotExist { .. }
            | Error::OperationNotExist { .. }
            | Error::UnknownLocal(_)
            | Error::UnknownUser(_)
            | Error::Unknown(_) => false,
            _ => !sent || mode.is_idempotent(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![Duration::ZERO])
    }
}
