use super::socks::{self, HandshakeError, TargetAddr};
use super::{Endpoint, ProxyHandle};
use crate::config::ProxyConfig;
use crate::error::{Result, SessionError, ValidationError};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;
use tokio_socks::IntoTargetAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Username/password for the upstream SOCKS5 server
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UpstreamAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for UpstreamAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Remote SOCKS5 server that all traffic is relayed through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub auth: Option<UpstreamAuth>,
}

impl Upstream {
    /// Open a SOCKS5 CONNECT through the upstream
    pub async fn dial<'t, T>(&self, target: T) -> std::result::Result<Socks5Stream<TcpStream>, tokio_socks::Error>
    where
        T: IntoTargetAddr<'t>,
    {
        match &self.auth {
            Some(auth) => {
                Socks5Stream::connect_with_password(self.addr, target, &auth.username, &auth.password)
                    .await
            }
            None => Socks5Stream::connect(self.addr, target).await,
        }
    }
}

/// Local SOCKS5 listener configuration
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Address to listen on; port 0 picks an ephemeral port
    pub listen_addr: SocketAddr,
    /// Bound on the upstream reachability check
    pub connect_timeout: Duration,
}

impl ProxyServerConfig {
    pub fn from_config(config: &ProxyConfig) -> std::result::Result<Self, ValidationError> {
        let host: IpAddr = config
            .listen_host
            .parse()
            .map_err(|_| ValidationError::InvalidListenHost {
                host: config.listen_host.clone(),
            })?;

        Ok(Self {
            listen_addr: SocketAddr::new(host, config.listen_port),
            connect_timeout: config.connect_timeout(),
        })
    }
}

struct RunningServer {
    endpoint: Endpoint,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Exposes a remote SOCKS5 proxy as an unauthenticated local SOCKS5 endpoint
pub struct UpstreamProxy {
    upstream: Arc<Upstream>,
    config: ProxyServerConfig,
    running: Mutex<Option<RunningServer>>,
}

impl UpstreamProxy {
    pub fn new(upstream: Upstream, config: ProxyServerConfig) -> Self {
        Self {
            upstream: Arc::new(upstream),
            config,
            running: Mutex::new(None),
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Endpoint of the running listener, if any
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.running.lock().await.as_ref().map(|server| server.endpoint)
    }

    async fn check_upstream(&self) -> Result<()> {
        let addr = self.upstream.addr;
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(SessionError::UpstreamUnavailable {
                addr,
                reason: e.to_string(),
            }),
            Err(_) => Err(SessionError::UpstreamUnavailable {
                addr,
                reason: "connection timed out".to_string(),
            }),
        }
    }
}

#[async_trait]
impl ProxyHandle for UpstreamProxy {
    fn remote_address(&self) -> SocketAddr {
        self.upstream.addr
    }

    async fn start(&self) -> Result<Endpoint> {
        // Held across the whole start so a concurrent start sees AlreadyStarted
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        self.check_upstream().await?;

        let listen_addr = self.config.listen_addr;
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| SessionError::Bind {
                addr: listen_addr,
                source,
            })?;
        let endpoint = listener
            .local_addr()
            .map(Endpoint::from)
            .map_err(|source| SessionError::Bind {
                addr: listen_addr,
                source,
            })?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, self.upstream.clone(), cancel.clone()));

        info!(
            "Proxy listening on {} (upstream {})",
            endpoint, self.upstream.addr
        );

        *running = Some(RunningServer {
            endpoint,
            cancel,
            task,
        });

        Ok(endpoint)
    }

    async fn stop(&self) {
        let server = self.running.lock().await.take();

        if let Some(server) = server {
            server.cancel.cancel();
            if let Err(e) = server.task.await {
                warn!("Proxy accept loop ended abnormally: {}", e);
            }
            info!("Proxy on {} stopped", server.endpoint);
        }
    }
}

impl Drop for UpstreamProxy {
    fn drop(&mut self) {
        if let Some(server) = self.running.get_mut().take() {
            server.cancel.cancel();
        }
    }
}

async fn accept_loop(listener: TcpListener, upstream: Arc<Upstream>, cancel: CancellationToken) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Failed to accept client: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            },
        };

        debug!("Client connected from {}", peer);

        // Each client is torn down with the listener
        let upstream = upstream.clone();
        let client_cancel = cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = client_cancel.cancelled() => {
                    debug!("Closing client {} on shutdown", peer);
                }
                result = handle_client(socket, &upstream) => {
                    if let Err(e) = result {
                        debug!("Client {} closed: {}", peer, e);
                    }
                }
            }
        });
    }

    debug!("Accept loop stopped");
}

/// Serve one local client: SOCKS5 handshake, upstream CONNECT, then relay
async fn handle_client(
    mut client: TcpStream,
    upstream: &Upstream,
) -> std::result::Result<(), HandshakeError> {
    let target = socks::accept(&mut client).await?;
    debug!("CONNECT request to {}", target);

    let dialed = match &target {
        TargetAddr::Ip(addr) => upstream.dial(*addr).await,
        TargetAddr::Domain(host, port) => upstream.dial((host.as_str(), *port)).await,
    };

    let mut remote = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            // Only log upstream connection failures at debug level
            debug!("Upstream connection to {} failed: {}", target, e);
            socks::send_reply(&mut client, socks::reply_code(&e)).await?;
            return Ok(());
        }
    };

    socks::send_reply(&mut client, socks::REPLY_SUCCEEDED).await?;

    tokio::io::copy_bidirectional(&mut client, &mut remote).await?;
    debug!("Tunnel closed for {}", target);

    Ok(())
}
