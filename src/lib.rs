pub mod acm;
pub mod batch;
pub mod cli;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod network;
pub mod observer;
pub mod outgoing;
pub mod protocol;
pub mod timer;
pub mod transport;

// Re-export key types for easy testing
pub use config::Config;
pub use connection::{Connection, ConnectionCallback, ConnectionInfo, DestroyReason, State};
pub use dispatch::{Adapter, DispatchOutcome, Dispatcher, IncomingRequest};
pub use error::{Error, Result};
pub use instance::Instance;
pub use network::{Endpoint, IncomingConnectionFactory, OutgoingConnectionFactory, Proxy, RetryPolicy};
pub use outgoing::{InvocationFuture, OutgoingAsync, Outcome};
pub use protocol::{OperationMode, Reply, ReplyBody, RequestHeader};
