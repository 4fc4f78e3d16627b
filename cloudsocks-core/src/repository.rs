//! Access codes and the repository that turns them into proxies

use crate::config::{ProxyConfig, RepositoryConfig};
use crate::error::{Result, SessionError, ValidationError};
use crate::filter::UpstreamFilter;
use crate::proxy::server::UpstreamAuth;
use crate::proxy::{ProxyHandle, ProxyServerConfig, Upstream, UpstreamProxy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};
use percent_encoding::percent_decode_str;
use url::{Host, Url};

const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Access token supplied by the user. Never printed in clear.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential(<{} chars>)", self.0.chars().count())
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<access code>")
    }
}

/// Parsed form of `socks5://[user:password@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessCode {
    pub host: String,
    pub port: u16,
    pub auth: Option<UpstreamAuth>,
}

impl AccessCode {
    pub fn parse(credential: &Credential, min_length: usize) -> Result<Self> {
        let raw = credential.as_str().trim();

        if raw.chars().count() < min_length {
            return Err(SessionError::InvalidCredential(format!(
                "must be at least {} characters",
                min_length
            )));
        }

        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(SessionError::InvalidCredential(
                "contains whitespace or control characters".to_string(),
            ));
        }

        let url = Url::parse(raw).map_err(|e| SessionError::InvalidCredential(e.to_string()))?;

        if url.scheme() != "socks5" {
            return Err(SessionError::InvalidCredential(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => {
                return Err(SessionError::InvalidCredential(
                    "missing proxy host".to_string(),
                ))
            }
        };

        let auth = if url.username().is_empty() {
            None
        } else {
            Some(UpstreamAuth {
                username: decode_userinfo(url.username())?,
                password: decode_userinfo(url.password().unwrap_or_default())?,
            })
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_SOCKS_PORT),
            auth,
        })
    }
}

/// Userinfo is percent-encoded in the URL; the upstream expects it raw
fn decode_userinfo(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| SessionError::InvalidCredential("credentials are not valid UTF-8".to_string()))
}

/// A resolved proxy the user has chosen, not yet started
#[derive(Clone)]
pub struct ProxySelection {
    remote_address: SocketAddr,
    handle: Arc<dyn ProxyHandle>,
}

impl ProxySelection {
    pub fn new(handle: Arc<dyn ProxyHandle>) -> Self {
        Self {
            remote_address: handle.remote_address(),
            handle,
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn handle(&self) -> &Arc<dyn ProxyHandle> {
        &self.handle
    }
}

impl std::fmt::Debug for ProxySelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySelection")
            .field("remote_address", &self.remote_address)
            .finish_non_exhaustive()
    }
}

/// Resolves access credentials into runnable proxies
#[async_trait]
pub trait ProxyRepository: Send + Sync {
    /// Validate the credential and provision or locate its proxy
    ///
    /// Submitting the same credential again yields an equivalent selection.
    async fn add_proxy(&self, credential: &Credential) -> Result<ProxySelection>;
}

/// Repository of remote SOCKS5 servers addressed by `socks5://` access codes
pub struct CloudSocksRepository {
    config: RepositoryConfig,
    server_config: ProxyServerConfig,
    filter: UpstreamFilter,
    known: Mutex<HashMap<AccessCode, Arc<UpstreamProxy>>>,
}

impl CloudSocksRepository {
    pub fn new(
        config: RepositoryConfig,
        proxy: &ProxyConfig,
    ) -> std::result::Result<Self, ValidationError> {
        Ok(Self {
            filter: UpstreamFilter::from_config(&config)?,
            server_config: ProxyServerConfig::from_config(proxy)?,
            config,
            known: Mutex::new(HashMap::new()),
        })
    }

    async fn resolve(&self, code: &AccessCode) -> Result<SocketAddr> {
        let lookup = tokio::net::lookup_host((code.host.as_str(), code.port));
        let mut addrs = tokio::time::timeout(self.config.provisioning_timeout(), lookup)
            .await
            .map_err(|_| {
                SessionError::Provisioning(format!("timed out resolving {}", code.host))
            })?
            .map_err(|e| SessionError::Network(format!("cannot resolve {}: {}", code.host, e)))?;

        addrs
            .next()
            .ok_or_else(|| SessionError::Network(format!("no addresses for {}", code.host)))
    }

    /// Contact the upstream to make sure it accepts us
    async fn exchange(&self, upstream: &Upstream) -> Result<()> {
        match &self.config.probe_target {
            Some(target) => {
                let stream = upstream.dial(target.as_str()).await.map_err(|e| match e {
                    tokio_socks::Error::Io(io) => SessionError::Network(io.to_string()),
                    other => SessionError::Provisioning(other.to_string()),
                })?;
                drop(stream);
            }
            None => {
                TcpStream::connect(upstream.addr).await.map_err(|e| match e.kind() {
                    std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::PermissionDenied => SessionError::Provisioning(format!(
                        "{} rejected the connection: {}",
                        upstream.addr, e
                    )),
                    _ => SessionError::Network(e.to_string()),
                })?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ProxyRepository for CloudSocksRepository {
    async fn add_proxy(&self, credential: &Credential) -> Result<ProxySelection> {
        let code = AccessCode::parse(credential, self.config.min_credential_length)?;

        if let Some(proxy) = self.known.lock().await.get(&code) {
            debug!("Access code already provisioned for {}", proxy.remote_address());
            return Ok(ProxySelection::new(proxy.clone()));
        }

        let addr = self.resolve(&code).await?;
        if !self.filter.allows(&code.host, addr.ip()) {
            return Err(SessionError::Provisioning(format!(
                "upstream {} is not permitted",
                code.host
            )));
        }

        let upstream = Upstream {
            addr,
            auth: code.auth.clone(),
        };

        tokio::time::timeout(self.config.provisioning_timeout(), self.exchange(&upstream))
            .await
            .map_err(|_| SessionError::Provisioning(format!("timed out contacting {}", addr)))??;

        info!("Provisioned upstream proxy {} ({})", code.host, addr);

        // Another caller may have provisioned the same code meanwhile
        let mut known = self.known.lock().await;
        let proxy = known
            .entry(code)
            .or_insert_with(|| Arc::new(UpstreamProxy::new(upstream, self.server_config.clone())))
            .clone();

        Ok(ProxySelection::new(proxy))
    }
}
