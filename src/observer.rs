//! Optional instrumentation hooks.

use crate::connection::State;
use crate::error::Error;

/// Receives connection lifecycle and traffic events.
///
/// Every method has an empty default. Events for one connection arrive in
/// the order they happened, after the connection lock is released, so hooks
/// may query the connection.
pub trait ConnectionObserver: Send + Sync {
    fn state_changed(&self, _connection: &str, _old: State, _new: State) {}

    fn sent_bytes(&self, _connection: &str, _count: usize) {}

    fn received_bytes(&self, _connection: &str, _count: usize) {}

    /// The connection closed with an error that was not part of a normal
    /// shutdown.
    fn failed(&self, _connection: &str, _error: &Error) {}
}
