//! Session controller
//!
//! Owns the lifecycle "select a proxy, start it, bridge it to a VPN device,
//! stop it again". All mutations go through one async mutex over the owned
//! resources:
//!
//! - operations that start something (`select_proxy`, `start_proxy`,
//!   `start_vpn`) are rejected with `OperationInProgress` while another
//!   operation holds the lock
//! - operations that stop something (`stop_proxy`, `stop_vpn`, `shutdown`)
//!   and the VPN disconnect handler wait for the lock and then run
//!
//! Every outcome is reported to the [`Notifier`] and the current
//! [`SessionState`] is published on a watch channel.

use crate::error::{Result, SessionError};
use crate::notify::Notifier;
use crate::proxy::Endpoint;
use crate::repository::{Credential, ProxyRepository, ProxySelection};
use crate::vpn::{DisconnectCallback, VpnBridge};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Selecting,
    Selected,
    Starting,
    Running,
    VpnStarting,
    VpnRunning,
    Stopping,
}

impl SessionState {
    /// Whether the local proxy endpoint is up
    pub fn is_proxy_running(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::VpnRunning)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Selecting => "selecting",
            SessionState::Selected => "selected",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::VpnStarting => "vpn starting",
            SessionState::VpnRunning => "vpn running",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
struct VpnBinding {
    epoch: u64,
    port: u16,
}

/// Resources owned by the controller
#[derive(Default)]
struct Slots {
    selection: Option<ProxySelection>,
    endpoint: Option<Endpoint>,
    vpn: Option<VpnBinding>,
}

struct Shared {
    repository: Arc<dyn ProxyRepository>,
    bridge: Arc<dyn VpnBridge>,
    notifier: Arc<dyn Notifier>,
    state: watch::Sender<SessionState>,
    slots: Mutex<Slots>,
    epoch: AtomicU64,
}

/// Cloneable handle to one proxy/VPN session
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        repository: Arc<dyn ProxyRepository>,
        bridge: Arc<dyn VpnBridge>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                repository,
                bridge,
                notifier,
                state,
                slots: Mutex::new(Slots::default()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receive every state change from now on
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Endpoint of the running proxy. Waits for any in-flight operation.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.shared.slots.lock().await.endpoint
    }

    /// Remote address of the current selection. Waits for any in-flight operation.
    pub async fn remote_address(&self) -> Option<SocketAddr> {
        self.shared
            .slots
            .lock()
            .await
            .selection
            .as_ref()
            .map(ProxySelection::remote_address)
    }

    /// Resolve a credential into the current selection
    ///
    /// Anything running is torn down and the previous selection dropped
    /// before the repository is asked. On failure the session is Idle.
    pub async fn select_proxy(&self, credential: Credential) -> Result<SocketAddr> {
        let mut slots = self.begin()?;

        self.release_all(&mut slots).await;
        self.set_state(SessionState::Selecting);

        match self.shared.repository.add_proxy(&credential).await {
            Ok(selection) => {
                let addr = selection.remote_address();
                slots.selection = Some(selection);
                self.set_state(SessionState::Selected);
                self.notify(&format!("Added server at {}", addr));
                Ok(addr)
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                self.fail(e)
            }
        }
    }

    /// Start the selected proxy's local endpoint
    pub async fn start_proxy(&self) -> Result<Endpoint> {
        let mut slots = self.begin()?;

        if slots.endpoint.is_some() {
            return self.fail(SessionError::AlreadyStarted);
        }
        let Some(selection) = slots.selection.clone() else {
            return self.fail(SessionError::NoSelection);
        };

        self.set_state(SessionState::Starting);
        match selection.handle().start().await {
            Ok(endpoint) => {
                slots.endpoint = Some(endpoint);
                self.set_state(SessionState::Running);
                self.notify(&format!("Proxy running on port {}", endpoint.port));
                Ok(endpoint)
            }
            Err(e) => {
                self.set_state(SessionState::Selected);
                self.fail(e)
            }
        }
    }

    /// Stop the proxy, and the VPN first if it is bound
    ///
    /// Waits for an in-flight operation. A no-op when the proxy is not running.
    pub async fn stop_proxy(&self) -> Result<()> {
        let mut slots = self.shared.slots.lock().await;
        if slots.endpoint.is_none() {
            debug!("Proxy not running, nothing to stop");
            return Ok(());
        }

        self.set_state(SessionState::Stopping);
        let vpn = self.release_vpn(&mut slots).await;
        self.release_proxy(&mut slots).await;
        self.set_state(SessionState::Selected);

        vpn.map(|_| ())
    }

    /// Route the VPN device through the running proxy
    pub async fn start_vpn(&self) -> Result<String> {
        let mut slots = self.begin()?;

        if slots.vpn.is_some() {
            return self.fail(SessionError::AlreadyBound);
        }
        let Some(endpoint) = slots.endpoint else {
            return self.fail(SessionError::ProxyNotRunning);
        };

        self.set_state(SessionState::VpnStarting);
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let on_disconnect = self.disconnect_callback(epoch);

        match self.shared.bridge.start(endpoint.port, on_disconnect).await {
            Ok(status) => {
                slots.vpn = Some(VpnBinding {
                    epoch,
                    port: endpoint.port,
                });
                self.set_state(SessionState::VpnRunning);
                self.notify(&format!("VPN started: {}", status));
                Ok(status)
            }
            Err(e) => {
                self.set_state(SessionState::Running);
                self.fail(e)
            }
        }
    }

    /// Unbind the VPN device, leaving the proxy running
    ///
    /// Waits for an in-flight operation. A no-op when no VPN is bound.
    pub async fn stop_vpn(&self) -> Result<()> {
        let mut slots = self.shared.slots.lock().await;
        if slots.vpn.is_none() {
            debug!("VPN not bound, nothing to stop");
            return Ok(());
        }

        self.set_state(SessionState::Stopping);
        let result = self.release_vpn(&mut slots).await;
        self.set_state(SessionState::Running);

        result.map(|_| ())
    }

    /// Stop everything and drop the selection
    pub async fn shutdown(&self) {
        let mut slots = self.shared.slots.lock().await;
        if slots.endpoint.is_some() || slots.vpn.is_some() {
            self.set_state(SessionState::Stopping);
        }
        self.release_all(&mut slots).await;
        self.set_state(SessionState::Idle);
        info!("Session shut down");
    }

    /// Lock for an operation that starts something
    fn begin(&self) -> Result<MutexGuard<'_, Slots>> {
        match self.shared.slots.try_lock() {
            Ok(slots) => Ok(slots),
            Err(_) => self.fail(SessionError::OperationInProgress),
        }
    }

    /// Tear down VPN, proxy and selection
    async fn release_all(&self, slots: &mut Slots) {
        if slots.endpoint.is_some() || slots.vpn.is_some() {
            self.set_state(SessionState::Stopping);
        }
        // Already reported; teardown carries on regardless
        let _ = self.release_vpn(slots).await;
        self.release_proxy(slots).await;

        if let Some(previous) = slots.selection.take() {
            previous.handle().stop().await;
            debug!("Dropped selection for {}", previous.remote_address());
        }
    }

    async fn release_vpn(&self, slots: &mut Slots) -> Result<Option<String>> {
        let Some(binding) = slots.vpn.take() else {
            return Ok(None);
        };

        debug!("Unbinding VPN from port {} (epoch {})", binding.port, binding.epoch);
        match self.shared.bridge.stop().await {
            Ok(status) => {
                self.notify(&format!("VPN stopped: {}", status));
                Ok(Some(status))
            }
            Err(e) => self.fail(e),
        }
    }

    async fn release_proxy(&self, slots: &mut Slots) {
        if slots.endpoint.take().is_none() {
            return;
        }
        if let Some(selection) = &slots.selection {
            selection.handle().stop().await;
        }
        self.notify("Proxy stopped");
    }

    fn disconnect_callback(&self, epoch: u64) -> DisconnectCallback {
        let shared = Arc::downgrade(&self.shared);
        let runtime = Handle::current();

        Box::new(move |reason: String| {
            runtime.spawn(async move {
                if let Some(shared) = shared.upgrade() {
                    SessionController { shared }
                        .handle_vpn_disconnect(epoch, reason)
                        .await;
                }
            });
        })
    }

    async fn handle_vpn_disconnect(&self, epoch: u64, reason: String) {
        let mut slots = self.shared.slots.lock().await;

        match slots.vpn {
            Some(binding) if binding.epoch == epoch => {}
            _ => {
                debug!("Ignoring disconnect from stale VPN binding (epoch {})", epoch);
                return;
            }
        }

        slots.vpn = None;
        if let Err(e) = self.shared.bridge.stop().await {
            warn!("Failed to clean up VPN device after disconnect: {}", e);
        }

        self.notify(&format!("Vpn disconnected: {}", reason));
        self.set_state(SessionState::Running);
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!("Session state {} -> {}", previous, state);
        }
    }

    fn notify(&self, message: &str) {
        debug!("{}", message);
        self.shared.notifier.on_log(message);
    }

    fn fail<T>(&self, error: SessionError) -> Result<T> {
        warn!("{}", error);
        self.shared.notifier.on_log(&error.to_string());
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventLog;
    use crate::proxy::ProxyHandle;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    const REMOTE: &str = "203.0.113.7:1080";

    #[derive(Default)]
    struct FakeHandle {
        running: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        start_delay: Duration,
        fail_start: bool,
    }

    #[async_trait]
    impl ProxyHandle for FakeHandle {
        fn remote_address(&self) -> SocketAddr {
            REMOTE.parse().unwrap()
        }

        async fn start(&self) -> Result<Endpoint> {
            tokio::time::sleep(self.start_delay).await;
            if self.fail_start {
                return Err(SessionError::UpstreamUnavailable {
                    addr: self.remote_address(),
                    reason: "connection refused".to_string(),
                });
            }
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(SessionError::AlreadyStarted);
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Endpoint::from("127.0.0.1:1080".parse::<SocketAddr>().unwrap()))
        }

        async fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeRepository {
        handle: Arc<FakeHandle>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProxyRepository for FakeRepository {
        async fn add_proxy(&self, credential: &Credential) -> Result<ProxySelection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if credential.as_str() == "bad" {
                return Err(SessionError::InvalidCredential("unknown token".to_string()));
            }
            Ok(ProxySelection::new(self.handle.clone()))
        }
    }

    #[derive(Default)]
    struct FakeBridge {
        bound: std::sync::Mutex<Option<DisconnectCallback>>,
        stops: AtomicUsize,
        deny: bool,
    }

    impl FakeBridge {
        /// Simulate the device going away on its own
        fn drop_link(&self, reason: &str) {
            let callback = self.bound.lock().unwrap().take();
            if let Some(callback) = callback {
                callback(reason.to_string());
            }
        }

        fn take_callback(&self) -> Option<DisconnectCallback> {
            self.bound.lock().unwrap().take()
        }
    }

    #[async_trait]
    impl VpnBridge for FakeBridge {
        async fn start(&self, port: u16, on_disconnect: DisconnectCallback) -> Result<String> {
            if self.deny {
                return Err(SessionError::PermissionDenied("CAP_NET_ADMIN required".to_string()));
            }
            let mut bound = self.bound.lock().unwrap();
            if bound.is_some() {
                return Err(SessionError::AlreadyBound);
            }
            *bound = Some(on_disconnect);
            Ok(format!("tun0 bound to 127.0.0.1:{}", port))
        }

        async fn stop(&self) -> Result<String> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            match self.bound.lock().unwrap().take() {
                Some(_) => Ok("tun0 unbound".to_string()),
                None => Ok("tun0 not bound".to_string()),
            }
        }
    }

    struct Harness {
        controller: SessionController,
        handle: Arc<FakeHandle>,
        repository: Arc<FakeRepository>,
        bridge: Arc<FakeBridge>,
        log: EventLog,
    }

    fn harness_with(handle: FakeHandle, bridge: FakeBridge, delay: Duration) -> Harness {
        let handle = Arc::new(handle);
        let repository = Arc::new(FakeRepository {
            handle: handle.clone(),
            delay,
            calls: AtomicUsize::new(0),
        });
        let bridge = Arc::new(bridge);
        let log = EventLog::new();
        let controller = SessionController::new(
            repository.clone(),
            bridge.clone(),
            Arc::new(log.clone()),
        );

        Harness {
            controller,
            handle,
            repository,
            bridge,
            log,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeHandle::default(), FakeBridge::default(), Duration::ZERO)
    }

    async fn running_vpn(h: &Harness) {
        h.controller.select_proxy("tok1".into()).await.unwrap();
        h.controller.start_proxy().await.unwrap();
        h.controller.start_vpn().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::VpnRunning);
    }

    /// Let spawned disconnect handlers run
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_vpn_link_down_keeps_proxy_running() {
        let h = harness();
        let mut states = h.controller.subscribe();

        let remote = h.controller.select_proxy("tok1".into()).await.unwrap();
        assert_eq!(remote, REMOTE.parse().unwrap());
        assert_eq!(h.controller.state(), SessionState::Selected);

        let endpoint = h.controller.start_proxy().await.unwrap();
        assert_eq!(endpoint.port, 1080);
        assert_eq!(h.controller.state(), SessionState::Running);

        let status = h.controller.start_vpn().await.unwrap();
        assert_eq!(status, "tun0 bound to 127.0.0.1:1080");
        assert_eq!(h.controller.state(), SessionState::VpnRunning);

        h.bridge.drop_link("link down");
        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|s| *s == SessionState::Running),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(h.handle.running.load(Ordering::SeqCst));
        assert_eq!(h.controller.endpoint().await, Some(endpoint));
        assert!(h
            .log
            .messages()
            .contains(&"Vpn disconnected: link down".to_string()));

        // The device can be bound again afterwards
        h.controller.start_vpn().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::VpnRunning);
    }

    #[tokio::test]
    async fn test_start_proxy_without_selection() {
        let h = harness();

        let result = h.controller.start_proxy().await;
        assert!(matches!(result, Err(SessionError::NoSelection)));
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.log.messages(), vec!["No proxy set"]);
    }

    #[tokio::test]
    async fn test_concurrent_selects_yield_one_selection() {
        let h = harness_with(
            FakeHandle::default(),
            FakeBridge::default(),
            Duration::from_millis(50),
        );

        let (first, second) = tokio::join!(
            h.controller.select_proxy("tok1".into()),
            h.controller.select_proxy("tok2".into()),
        );

        let outcomes = [&first, &second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(SessionError::OperationInProgress)))
                .count(),
            1
        );
        assert_eq!(h.repository.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.state(), SessionState::Selected);
    }

    #[tokio::test]
    async fn test_start_proxy_twice() {
        let h = harness();
        h.controller.select_proxy("tok1".into()).await.unwrap();
        h.controller.start_proxy().await.unwrap();

        let result = h.controller.start_proxy().await;
        assert!(matches!(result, Err(SessionError::AlreadyStarted)));
        assert_eq!(h.controller.state(), SessionState::Running);
        assert_eq!(h.handle.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_proxy_is_idempotent() {
        let h = harness();

        // Nothing to stop yet
        h.controller.stop_proxy().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Idle);

        h.controller.select_proxy("tok1".into()).await.unwrap();
        h.controller.start_proxy().await.unwrap();

        h.controller.stop_proxy().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Selected);
        h.controller.stop_proxy().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Selected);

        assert!(!h.handle.running.load(Ordering::SeqCst));
        assert_eq!(h.handle.stops.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.endpoint().await, None);
    }

    #[tokio::test]
    async fn test_stop_proxy_stops_vpn_first() {
        let h = harness();
        running_vpn(&h).await;

        h.controller.stop_proxy().await.unwrap();

        assert_eq!(h.controller.state(), SessionState::Selected);
        assert!(!h.handle.running.load(Ordering::SeqCst));
        assert_eq!(h.bridge.stops.load(Ordering::SeqCst), 1);

        let messages = h.log.messages();
        let vpn = messages.iter().position(|m| m == "VPN stopped: tun0 unbound");
        let proxy = messages.iter().position(|m| m == "Proxy stopped");
        assert!(vpn.unwrap() < proxy.unwrap());
    }

    #[tokio::test]
    async fn test_vpn_requires_running_proxy() {
        let h = harness();

        assert!(matches!(
            h.controller.start_vpn().await,
            Err(SessionError::ProxyNotRunning)
        ));
        assert_eq!(h.controller.state(), SessionState::Idle);

        h.controller.select_proxy("tok1".into()).await.unwrap();
        assert!(matches!(
            h.controller.start_vpn().await,
            Err(SessionError::ProxyNotRunning)
        ));
        assert_eq!(h.controller.state(), SessionState::Selected);
        assert!(h.bridge.bound.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_vpn_twice() {
        let h = harness();
        running_vpn(&h).await;

        assert!(matches!(
            h.controller.start_vpn().await,
            Err(SessionError::AlreadyBound)
        ));
        assert_eq!(h.controller.state(), SessionState::VpnRunning);
    }

    #[tokio::test]
    async fn test_vpn_start_failure_returns_to_running() {
        let bridge = FakeBridge {
            deny: true,
            ..Default::default()
        };
        let h = harness_with(FakeHandle::default(), bridge, Duration::ZERO);
        h.controller.select_proxy("tok1".into()).await.unwrap();
        h.controller.start_proxy().await.unwrap();

        let result = h.controller.start_vpn().await;
        assert!(matches!(result, Err(SessionError::PermissionDenied(_))));
        assert_eq!(h.controller.state(), SessionState::Running);
        assert_eq!(
            h.log.messages().last().unwrap(),
            "Permission denied: CAP_NET_ADMIN required"
        );
    }

    #[tokio::test]
    async fn test_stop_vpn_is_idempotent() {
        let h = harness();
        running_vpn(&h).await;

        h.controller.stop_vpn().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Running);
        h.controller.stop_vpn().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Running);

        assert_eq!(h.bridge.stops.load(Ordering::SeqCst), 1);
        assert!(h.handle.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disconnect_after_stop_vpn_is_ignored() {
        let h = harness();
        running_vpn(&h).await;

        let late = h.bridge.take_callback().unwrap();
        h.controller.stop_vpn().await.unwrap();

        late("link down".to_string());
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Running);
        assert!(!h
            .log
            .messages()
            .iter()
            .any(|m| m.starts_with("Vpn disconnected")));
    }

    #[tokio::test]
    async fn test_disconnect_from_previous_binding_is_ignored() {
        let h = harness();
        running_vpn(&h).await;

        let stale = h.bridge.take_callback().unwrap();
        h.controller.stop_vpn().await.unwrap();
        h.controller.start_vpn().await.unwrap();

        stale("old device gone".to_string());
        settle().await;

        assert_eq!(h.controller.state(), SessionState::VpnRunning);
        assert!(h.bridge.bound.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight_start() {
        let handle = FakeHandle {
            start_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness_with(handle, FakeBridge::default(), Duration::ZERO);
        h.controller.select_proxy("tok1".into()).await.unwrap();

        let controller = h.controller.clone();
        let start = tokio::spawn(async move { controller.start_proxy().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.controller.state(), SessionState::Starting);

        h.controller.stop_proxy().await.unwrap();

        assert!(start.await.unwrap().is_ok());
        assert_eq!(h.controller.state(), SessionState::Selected);
        assert!(!h.handle.running.load(Ordering::SeqCst));
        assert_eq!(
            h.log.messages(),
            vec![
                format!("Added server at {}", REMOTE),
                "Proxy running on port 1080".to_string(),
                "Proxy stopped".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_start_rejected_while_busy() {
        let handle = FakeHandle {
            start_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness_with(handle, FakeBridge::default(), Duration::ZERO);
        h.controller.select_proxy("tok1".into()).await.unwrap();

        let (first, second) = tokio::join!(h.controller.start_proxy(), h.controller.start_vpn());

        assert!(first.is_ok());
        assert!(matches!(second, Err(SessionError::OperationInProgress)));
        assert_eq!(h.controller.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_failed_selection_returns_to_idle() {
        let h = harness();
        h.controller.select_proxy("tok1".into()).await.unwrap();

        let result = h.controller.select_proxy("bad".into()).await;
        assert!(matches!(result, Err(SessionError::InvalidCredential(_))));
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.controller.remote_address().await, None);

        // Previous selection was released before the new one was tried
        assert_eq!(h.handle.stops.load(Ordering::SeqCst), 1);
        assert!(matches!(
            h.controller.start_proxy().await,
            Err(SessionError::NoSelection)
        ));
    }

    #[tokio::test]
    async fn test_failed_start_returns_to_selected() {
        let handle = FakeHandle {
            fail_start: true,
            ..Default::default()
        };
        let h = harness_with(handle, FakeBridge::default(), Duration::ZERO);
        h.controller.select_proxy("tok1".into()).await.unwrap();

        let result = h.controller.start_proxy().await;
        assert!(matches!(
            result,
            Err(SessionError::UpstreamUnavailable { .. })
        ));
        assert_eq!(h.controller.state(), SessionState::Selected);
        assert_eq!(h.controller.endpoint().await, None);
    }

    #[tokio::test]
    async fn test_reselect_tears_down_running_session() {
        let h = harness();
        running_vpn(&h).await;

        h.controller.select_proxy("tok2".into()).await.unwrap();

        assert_eq!(h.controller.state(), SessionState::Selected);
        assert!(!h.handle.running.load(Ordering::SeqCst));
        assert!(h.bridge.bound.lock().unwrap().is_none());
        assert_eq!(h.controller.endpoint().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let h = harness();
        running_vpn(&h).await;

        h.controller.shutdown().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(!h.handle.running.load(Ordering::SeqCst));
        assert!(h.bridge.bound.lock().unwrap().is_none());
        assert_eq!(h.controller.remote_address().await, None);
    }

    #[tokio::test]
    async fn test_log_lines_in_order() {
        let h = harness();
        running_vpn(&h).await;
        h.controller.stop_vpn().await.unwrap();
        h.controller.stop_proxy().await.unwrap();

        assert_eq!(
            h.log.messages(),
            vec![
                format!("Added server at {}", REMOTE),
                "Proxy running on port 1080".to_string(),
                "VPN started: tun0 bound to 127.0.0.1:1080".to_string(),
                "VPN stopped: tun0 unbound".to_string(),
                "Proxy stopped".to_string(),
            ]
        );
    }
}
