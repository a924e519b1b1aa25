//! Server-side request dispatch.

use crate::error::Error;
use crate::protocol::message::{OperationMode, ReplyBody, RequestHeader};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A request received on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    /// Zero for one-way and batch requests.
    pub request_id: i32,
    pub header: RequestHeader,
    pub params: Vec<u8>,
    /// The request arrived compressed or advertised compression support.
    pub compress: bool,
}

impl IncomingRequest {
    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }

    pub fn operation(&self) -> &str {
        &self.header.operation
    }

    pub fn mode(&self) -> OperationMode {
        self.header.mode
    }
}

pub type ReplyFuture = Pin<Box<dyn Future<Output = ReplyBody> + Send>>;

/// Result of handing a request to a dispatcher.
pub enum DispatchOutcome {
    Reply(ReplyBody),
    /// The reply is produced later; the connection drives the future.
    Pending(ReplyFuture),
}

impl fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Reply(body) => f.debug_tuple("Reply").field(body).finish(),
            DispatchOutcome::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Handler invoked for every incoming request.
///
/// Dispatchers are called without any connection lock held and may issue
/// new invocations from within `dispatch`.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, request: IncomingRequest) -> Result<DispatchOutcome, Error>;
}

impl<F> Dispatcher for F
where
    F: Fn(IncomingRequest) -> Result<DispatchOutcome, Error> + Send + Sync,
{
    fn dispatch(&self, request: IncomingRequest) -> Result<DispatchOutcome, Error> {
        self(request)
    }
}

/// A named dispatcher that connections deliver requests to.
#[derive(Clone)]
pub struct Adapter {
    name: String,
    dispatcher: Arc<dyn Dispatcher>,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter").field("name", &self.name).finish()
    }
}

impl Adapter {
    pub fn new(name: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            name: name.into(),
            dispatcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }
}

/// Map a dispatch failure to the reply the caller receives.
///
/// Application faults and the not-exist family keep their meaning; any
/// other runtime error is reported as an unknown local error.
pub fn reply_for_error(error: Error, header: &RequestHeader) -> ReplyBody {
    match error {
        Error::UserException { payload } => ReplyBody::UserException(payload),
        Error::ObjectNotExist { .. } => ReplyBody::ObjectNotExist(header.clone()),
        Error::FacetNotExist { .. } => ReplyBody::FacetNotExist(header.clone()),
        Error::OperationNotExist { .. } => ReplyBody::OperationNotExist(header.clone()),
        Error::UnknownUser(reason) => ReplyBody::UnknownUser(reason),
        Error::Unknown(reason) => ReplyBody::Unknown(reason),
        other => ReplyBody::UnknownLocal(other.to_string()),
    }
}

/// Describe a panic payload caught around a dispatcher.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "dispatcher panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_to_reply_mapping() {
        let header = RequestHeader::new("obj", "op");
        assert_eq!(
            reply_for_error(Error::UserException { payload: vec![1] }, &header),
            ReplyBody::UserException(vec![1])
        );
        assert_eq!(
            reply_for_error(
                Error::OperationNotExist {
                    identity: String::new(),
                    facet: String::new(),
                    operation: String::new()
                },
                &header
            ),
            ReplyBody::OperationNotExist(header.clone())
        );
        assert!(matches!(
            reply_for_error(Error::ConnectionTimeout, &header),
            ReplyBody::UnknownLocal(_)
        ));
    }

    #[test]
    fn test_closure_dispatcher() {
        let echo = |request: IncomingRequest| -> Result<DispatchOutcome, Error> {
            Ok(DispatchOutcome::Reply(ReplyBody::Ok(request.params)))
        };
        let adapter = Adapter::new("echo", Arc::new(echo));
        let request = IncomingRequest {
            request_id: 7,
            header: RequestHeader::new("obj", "echo"),
            params: vec![1, 2],
            compress: false,
        };
        assert!(!request.is_oneway());
        match adapter.dispatcher().dispatch(request).unwrap() {
            DispatchOutcome::Reply(body) => assert_eq!(body, ReplyBody::Ok(vec![1, 2])),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(adapter.name(), "echo");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(payload.as_ref()), "dispatcher panicked");
    }
}
