//! Configuration schema types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete cloudsocks configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub vpn: VpnConfig,
}

/// Settings shared by every front end
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommonConfig {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    #[serde(default)]
    pub verbose: bool,
}

fn default_config_version() -> String {
    "1.0".to_string()
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            verbose: false,
        }
    }
}

/// Local SOCKS5 endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Port 0 picks an ephemeral port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    1080
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Access code validation and upstream provisioning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_min_credential_length")]
    pub min_credential_length: usize,
    #[serde(default = "default_provisioning_timeout_ms")]
    pub provisioning_timeout_ms: u64,
    /// Wildcard patterns an upstream host must match
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// CIDR ranges an upstream address must fall in
    #[serde(default)]
    pub allowed_ranges: Vec<String>,
    /// "host:port" to CONNECT to through the upstream while provisioning
    #[serde(default)]
    pub probe_target: Option<String>,
}

fn default_min_credential_length() -> usize {
    12
}

fn default_provisioning_timeout_ms() -> u64 {
    10_000
}

impl RepositoryConfig {
    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_millis(self.provisioning_timeout_ms)
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            min_credential_length: default_min_credential_length(),
            provisioning_timeout_ms: default_provisioning_timeout_ms(),
            allowed_hosts: Vec::new(),
            allowed_ranges: Vec::new(),
            probe_target: None,
        }
    }
}

/// tun2socks device bridge settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VpnConfig {
    #[serde(default = "default_tun2socks_path")]
    pub tun2socks_path: String,
    #[serde(default = "default_device")]
    pub device: String,
    /// Arguments with `{device}`, `{host}` and `{port}` placeholders
    #[serde(default = "default_vpn_args")]
    pub args: Vec<String>,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

fn default_tun2socks_path() -> String {
    "tun2socks".to_string()
}

fn default_device() -> String {
    "tun0".to_string()
}

fn default_vpn_args() -> Vec<String> {
    ["-device", "tun://{device}", "-proxy", "socks5://{host}:{port}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_startup_grace_ms() -> u64 {
    500
}

impl VpnConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Expand the argument template for a SOCKS endpoint
    pub fn expand_args(&self, host: &str, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{device}", &self.device)
                    .replace("{host}", host)
                    .replace("{port}", &port)
            })
            .collect()
    }
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            tun2socks_path: default_tun2socks_path(),
            device: default_device(),
            args: default_vpn_args(),
            startup_grace_ms: default_startup_grace_ms(),
        }
    }
}
