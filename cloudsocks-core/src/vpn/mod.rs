//! VPN device bridges

pub mod tun2socks;

use crate::error::Result;
use async_trait::async_trait;

pub use tun2socks::Tun2SocksBridge;

/// Invoked with a reason when a bound device goes away on its own
pub type DisconnectCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Binds a local VPN network device to a SOCKS endpoint on loopback
#[async_trait]
pub trait VpnBridge: Send + Sync {
    /// Route device traffic to `127.0.0.1:port`
    ///
    /// `on_disconnect` runs at most once, from another task, if the device
    /// stops without `stop` being called. Fails with `AlreadyBound`,
    /// `PermissionDenied` or `DeviceUnavailable`; a failed start leaves no
    /// binding behind.
    async fn start(&self, port: u16, on_disconnect: DisconnectCallback) -> Result<String>;

    /// Unbind the device and drop any pending disconnect callback.
    /// A no-op when nothing is bound.
    async fn stop(&self) -> Result<String>;
}
