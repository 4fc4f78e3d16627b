//! Error types for session and configuration operations

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid access code: {0}")]
    InvalidCredential(String),

    #[error("Failed to provision proxy: {0}")]
    Provisioning(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to bind local endpoint {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Upstream proxy {addr} unavailable: {reason}")]
    UpstreamUnavailable { addr: SocketAddr, reason: String },

    #[error("Proxy already started")]
    AlreadyStarted,

    #[error("VPN device already bound")]
    AlreadyBound,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("VPN device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("No proxy set")]
    NoSelection,

    #[error("Proxy is not running")]
    ProxyNotRunning,

    #[error("Another operation is in progress")]
    OperationInProgress,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid wildcard pattern: {pattern}")]
    InvalidPattern { pattern: String },

    #[error("Invalid CIDR notation: {cidr}")]
    InvalidCidr { cidr: String },

    #[error("Invalid listen host: {host}")]
    InvalidListenHost { host: String },

    #[error("Invalid probe target: {target}")]
    InvalidProbeTarget { target: String },

    #[error("{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },

    #[error("Missing {{port}} placeholder in tun2socks arguments")]
    MissingPortPlaceholder,
}
