//! Local SOCKS5 endpoints backed by a remote proxy

pub mod server;
pub mod socks;

use crate::error::Result;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};

pub use server::{ProxyServerConfig, Upstream, UpstreamProxy};

/// Local address/port pair exposed by a running proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// One remote SOCKS proxy that can be exposed locally
#[async_trait]
pub trait ProxyHandle: Send + Sync {
    /// Address of the remote proxy
    fn remote_address(&self) -> SocketAddr;

    /// Start the local endpoint
    ///
    /// Fails with `AlreadyStarted` when running, `UpstreamUnavailable` when
    /// the remote cannot be reached and `Bind` when the local address is
    /// taken. A failed start leaves nothing running.
    async fn start(&self) -> Result<Endpoint>;

    /// Stop the local endpoint. A no-op when not started.
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::from("127.0.0.1:1080".parse::<SocketAddr>().unwrap());
        assert_eq!(endpoint.port, 1080);
        assert_eq!(endpoint.to_string(), "127.0.0.1:1080");
    }
}
