use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the connection runtime.
///
/// The terminal error of a connection is shared with every caller that still
/// had work queued on it, so the type is `Clone`. I/O failures are captured
/// as their kind and message for the same reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Protocol violations. Always fatal to a stream connection.
    #[error("Bad magic in message header: {magic:02x?}")]
    BadMagic { magic: [u8; 4] },

    #[error("Unsupported protocol version {major}.{minor} (supported: {supported})")]
    UnsupportedProtocol {
        major: u8,
        minor: u8,
        supported: String,
    },

    #[error("Unsupported encoding version {major}.{minor} (supported: {supported})")]
    UnsupportedEncoding {
        major: u8,
        minor: u8,
        supported: String,
    },

    #[error("Illegal message size: {size}")]
    IllegalMessageSize { size: i64 },

    #[error("Message too large: {size} bytes exceeds maximum of {max_size} bytes")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Unknown message type: {message_type}")]
    UnknownMessage { message_type: u8 },

    #[error("Connection not validated: received {reason}")]
    ConnectionNotValidated { reason: String },

    #[error("Unmarshal error: {reason}")]
    Unmarshal { reason: String },

    #[error("Compression error: {reason}")]
    Compression { reason: String },

    #[error("Datagram limit exceeded: {size} bytes")]
    DatagramLimit { size: usize },

    // Lifecycle
    #[error("Connection closed gracefully by peer")]
    CloseConnection,

    #[error("Connection forcefully closed")]
    ForcedClose,

    #[error("Connection timed out (idle)")]
    ConnectionTimeout,

    #[error("Connect timed out after {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("Close timed out after {timeout:?}")]
    CloseTimeout { timeout: Duration },

    #[error("Operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Runtime destroyed")]
    RuntimeDestroyed,

    #[error("Adapter `{name}` deactivated")]
    AdapterDeactivated { name: String },

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Connect failed to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Socket error ({kind:?}): {reason}")]
    Socket { kind: io::ErrorKind, reason: String },

    // Invocation
    #[error("Request not sent, safe to retry: {0}")]
    Retry(Box<Error>),

    #[error("Invocation canceled")]
    InvocationCanceled,

    #[error("No endpoint available: {reason}")]
    NoEndpoint { reason: String },

    // Carried by replies
    #[error("Object `{identity}` does not exist (operation `{operation}`)")]
    ObjectNotExist {
        identity: String,
        facet: String,
        operation: String,
    },

    #[error("Facet `{facet}` of object `{identity}` does not exist (operation `{operation}`)")]
    FacetNotExist {
        identity: String,
        facet: String,
        operation: String,
    },

    #[error("Operation `{operation}` does not exist on object `{identity}`")]
    OperationNotExist {
        identity: String,
        facet: String,
        operation: String,
    },

    #[error("Application error raised by operation ({} bytes)", payload.len())]
    UserException { payload: Vec<u8> },

    #[error("Unknown local error: {0}")]
    UnknownLocal(String),

    #[error("Unknown user error: {0}")]
    UnknownUser(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a transport I/O failure.
    ///
    /// EOF-like kinds become `ConnectionLost`, everything else a `Socket` error.
    pub fn from_io(err: &io::Error, operation: &str) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Error::ConnectionLost {
                reason: format!("{} failed: {}", operation, err),
            },
            kind => Error::Socket {
                kind,
                reason: format!("{} failed: {}", operation, err),
            },
        }
    }

    pub fn unmarshal(reason: impl Into<String>) -> Self {
        Error::Unmarshal {
            reason: reason.into(),
        }
    }

    /// Errors that terminate a connection as part of a normal shutdown and
    /// therefore are not worth a warning.
    pub fn is_expected_close(&self, closing: bool) -> bool {
        match self {
            Error::CloseConnection
            | Error::ForcedClose
            | Error::ConnectionTimeout
            | Error::RuntimeDestroyed
            | Error::AdapterDeactivated { .. } => true,
            Error::ConnectionLost { .. } => closing,
            _ => false,
        }
    }

    /// True for protocol-level violations that will not self-correct on retry.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::BadMagic { .. }
                | Error::UnsupportedProtocol { .. }
                | Error::UnsupportedEncoding { .. }
                | Error::IllegalMessageSize { .. }
                | Error::MessageTooLarge { .. }
                | Error::UnknownMessage { .. }
                | Error::ConnectionNotValidated { .. }
                | Error::Unmarshal { .. }
                | Error::Compression { .. }
        )
    }

    /// Failures after which a request may be resent even if its bytes
    /// already reached the peer.
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            Error::Retry(_) | Error::CloseConnection | Error::ObjectNotExist { .. }
        )
    }

    /// Failures raised before any byte of the request was written. The
    /// request can go to another connection whatever its mode.
    pub fn is_retryable_before_send(&self) -> bool {
        matches!(
            self,
            Error::Retry(_)
                | Error::ConnectFailed { .. }
                | Error::ConnectTimeout { .. }
                | Error::NoEndpoint { .. }
        )
    }

    /// Errors the runtime itself decided are final for the caller.
    pub fn is_terminal_for_caller(&self) -> bool {
        matches!(
            self,
            Error::RuntimeDestroyed
                | Error::InvocationCanceled
                | Error::Configuration(_)
                | Error::FeatureNotSupported(_)
        ) || self.is_protocol_violation()
    }

    /// Strip a `Retry` wrapper and return the underlying cause.
    pub fn into_cause(self) -> Error {
        match self {
            Error::Retry(inner) => *inner,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from_io(&eof, "read"), Error::ConnectionLost { .. }));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        match Error::from_io(&refused, "connect") {
            Error::Socket { kind, .. } => assert_eq!(kind, io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_expected_close_classification() {
        assert!(Error::CloseConnection.is_expected_close(false));
        assert!(Error::ForcedClose.is_expected_close(false));
        let lost = Error::ConnectionLost {
            reason: "reset".to_string(),
        };
        assert!(!lost.is_expected_close(false));
        assert!(lost.is_expected_close(true));
        assert!(!Error::BadMagic { magic: [0; 4] }.is_expected_close(true));
    }

    #[test]
    fn test_retry_safe_set() {
        assert!(Error::CloseConnection.is_retry_safe());
        assert!(Error::Retry(Box::new(Error::ForcedClose)).is_retry_safe());
        assert!(Error::ObjectNotExist {
            identity: "a".into(),
            facet: String::new(),
            operation: "op".into()
        }
        .is_retry_safe());
        assert!(!Error::ConnectionTimeout.is_retry_safe());
        assert!(!Error::ConnectionLost {
            reason: "x".into()
        }
        .is_retry_safe());
    }

    #[test]
    fn test_retryable_before_send() {
        assert!(Error::Retry(Box::new(Error::ForcedClose)).is_retryable_before_send());
        assert!(Error::ConnectTimeout {
            timeout: Duration::from_millis(5)
        }
        .is_retryable_before_send());
        assert!(!Error::CloseConnection.is_retryable_before_send());
        assert!(!Error::Timeout {
            timeout: Duration::from_millis(5)
        }
        .is_retryable_before_send());
    }

    #[test]
    fn test_into_cause_unwraps_retry() {
        let err = Error::Retry(Box::new(Error::CloseConnection));
        assert_eq!(err.into_cause(), Error::CloseConnection);
        assert_eq!(Error::ForcedClose.into_cause(), Error::ForcedClose);
    }
}
