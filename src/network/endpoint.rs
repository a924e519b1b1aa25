use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    /// In-process pair; not connectable through a factory.
    Memory,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Memory => "memory",
        }
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, Transport::Udp)
    }
}

/// Where a connection goes, and the per-endpoint settings it carries.
///
/// Two endpoints are the same connection target only if all fields match,
/// so a compressed and an uncompressed endpoint get separate connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    /// Read/write timeout for connections to this endpoint.
    pub timeout: Option<Duration>,
    pub compress: bool,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: Transport::Tcp,
            host: host.into(),
            port,
            timeout: None,
            compress: false,
        }
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: Transport::Udp,
            ..Self::tcp(host, port)
        }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            transport: Transport::Memory,
            ..Self::tcp(name, 0)
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// `host:port`, suitable for the tokio socket APIs.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            Transport::Memory => write!(f, "memory://{}", self.host),
            transport => write!(f, "{}://{}", transport.as_str(), self.address()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parse `host:port`, `tcp://host:port` or `udp://host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| Error::NoEndpoint {
            reason: format!("invalid endpoint `{}`: {}", s, reason),
        };

        let (transport, rest) = match s.split_once("://") {
            Some(("tcp", rest)) => (Transport::Tcp, rest),
            Some(("udp", rest)) => (Transport::Udp, rest),
            Some(("memory", rest)) => return Ok(Endpoint::memory(rest)),
            Some((scheme, _)) => return Err(invalid(&format!("unknown transport `{}`", scheme))),
            None => (Transport::Tcp, s),
        };

        let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;

        Ok(Self {
            transport,
            ..Endpoint::tcp(host, port)
        })
    }
}
