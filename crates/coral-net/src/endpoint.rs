//! Endpoint URLs and slave locators.

use std::fmt::{self, Display};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// A network endpoint in URL form, e.g. `tcp://10.0.0.2:51380`.
///
/// Only the `tcp` scheme is supported by this substrate. The host part may
/// be a hostname, an IP address, or `*` (meaning "all interfaces" when
/// binding). Port 0 means "let the OS choose" when binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Creates an endpoint from a resolved socket address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns a copy of this endpoint with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }

    /// The URL form of the endpoint.
    pub fn url(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    /// Resolves the endpoint to a socket address for connecting.
    pub fn socket_addr(&self) -> NetResult<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| NetError::InvalidEndpoint(self.url(), e.to_string()))?
            .next()
            .ok_or_else(|| {
                NetError::InvalidEndpoint(self.url(), "host did not resolve".to_string())
            })
    }

    /// Resolves the endpoint to a socket address for binding.
    ///
    /// A host of `*` binds to all interfaces.
    pub fn bind_addr(&self) -> NetResult<SocketAddr> {
        if self.host == "*" {
            Ok(SocketAddr::from(([0, 0, 0, 0], self.port)))
        } else {
            self.socket_addr()
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| NetError::InvalidEndpoint(s.to_string(), why.to_string());
        let rest = s
            .strip_prefix("tcp://")
            .ok_or_else(|| invalid("expected \"tcp://\" scheme"))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected \"host:port\""))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port number"))?;
        Ok(Endpoint::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = NetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(ep: Endpoint) -> Self {
        ep.url()
    }
}

/// Information needed to connect to one slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveLocator {
    /// The slave's control (request/reply) endpoint.
    pub control: Endpoint,
    /// The slave's variable-publisher endpoint.
    pub data_pub: Endpoint,
}

impl SlaveLocator {
    pub fn new(control: Endpoint, data_pub: Endpoint) -> Self {
        Self { control, data_pub }
    }
}
