//! Endpoints, connection factories and proxies.

pub mod endpoint;
pub mod factory;
pub mod proxy;
pub mod retry;
pub mod server;

pub use endpoint::{Endpoint, Transport};
pub use factory::OutgoingConnectionFactory;
pub use proxy::Proxy;
pub use retry::RetryPolicy;
pub use server::IncomingConnectionFactory;
