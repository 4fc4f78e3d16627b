//! Proxy/VPN session control for cloudsocks
//!
//! A [`SessionController`] selects a remote SOCKS5 proxy from an access code,
//! exposes it as a local SOCKS5 endpoint and optionally routes a VPN device
//! through that endpoint.

pub mod config;
pub mod error;
pub mod filter;
pub mod notify;
pub mod proxy;
pub mod repository;
pub mod session;
pub mod vpn;

// Re-export commonly used types
pub use config::{Config, ConfigLoader};
pub use error::{ConfigError, Result, SessionError, ValidationError};
pub use notify::{ChannelNotifier, EventLog, LogEntry, Notifier, TracingNotifier};
pub use proxy::{Endpoint, ProxyHandle, UpstreamProxy};
pub use repository::{CloudSocksRepository, Credential, ProxyRepository, ProxySelection};
pub use session::{SessionController, SessionState};
pub use vpn::{DisconnectCallback, Tun2SocksBridge, VpnBridge};
