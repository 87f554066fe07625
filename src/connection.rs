//! Connection management
//!
//! Drives the link lifecycle `scan -> connect -> discover -> subscribe -> ready`
//! with bounded retries, and is the only component that talks to the platform
//! transport. Notifications from every subscribed characteristic are forwarded,
//! tagged with their [`CharacteristicRole`], into a single channel consumed by
//! the protocol engine. Per-characteristic ordering is preserved.
//!
//! Every `connect` and `disconnect` call advances an operation epoch; waits
//! inside an in-flight connect observe the epoch and abort as soon as it moves.

use crate::config::LinkConfig;
use crate::registry::{role_table, CharacteristicHandle, CharacteristicRegistry};
use crate::types::{
    CharacteristicRole, ConnectTarget, ConnectionState, DeviceRecord, LinkError, LinkRole,
    PeerKind, Result,
};
use futures::stream::{Stream, StreamExt};
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Stream of values from one characteristic
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Capabilities the platform BLE stack must provide
#[async_trait::async_trait]
pub trait LinkTransport: Send + Sync {
    /// Scan the local radio for advertising devices
    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceRecord>>;

    /// Connect to a device; resolves once the stack reports "connected"
    async fn connect(&self, address: &str) -> Result<()>;

    /// Wait for a peer to connect to us; returns its address
    async fn accept(&self) -> Result<String>;

    /// Discover the characteristics of the connected device
    async fn discover(&self) -> Result<Vec<CharacteristicHandle>>;

    /// Largest value a single write may carry on this link
    async fn max_write_len(&self) -> Result<usize>;

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>>;

    async fn write(&self, handle: &CharacteristicHandle, data: &[u8]) -> Result<()>;

    /// Start receiving change notifications
    async fn enable_notifications(&self, handle: &CharacteristicHandle)
        -> Result<NotificationStream>;

    /// Write the client characteristic configuration descriptor
    async fn write_client_config(&self, handle: &CharacteristicHandle, enable: bool) -> Result<()>;

    /// Resolves when the current link drops
    async fn wait_disconnected(&self);

    async fn disconnect(&self) -> Result<()>;
}

/// The active connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub role: LinkRole,
    pub peer: PeerKind,
    pub address: String,
    pub max_write: usize,
}

/// Messages from the connection manager to the protocol engine.
///
/// Each notice carries the epoch of the link it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    Notification {
        epoch: u64,
        role: CharacteristicRole,
        data: Vec<u8>,
    },
    /// The transport dropped an established link
    LinkLost { epoch: u64 },
}

impl LinkNotice {
    pub fn epoch(&self) -> u64 {
        match self {
            LinkNotice::Notification { epoch, .. } | LinkNotice::LinkLost { epoch } => *epoch,
        }
    }
}

#[derive(Default)]
struct LinkSlot {
    link: Option<Link>,
    registry: CharacteristicRegistry,
    listeners: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl LinkSlot {
    /// Drop the link, returning the handles that had notifications enabled
    fn release(&mut self) -> Vec<CharacteristicHandle> {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        let subscribed = self.registry.subscriptions();
        self.registry.clear();
        self.link = None;
        subscribed
    }
}

/// Owner of the single link and its characteristic registry
pub struct ConnectionManager {
    transport: Arc<dyn LinkTransport>,
    config: LinkConfig,
    state_tx: watch::Sender<ConnectionState>,
    epoch_tx: watch::Sender<u64>,
    slot: Mutex<LinkSlot>,
    /// Serializes remote I/O so writes never interleave on the wire
    io_lock: Mutex<()>,
    notice_tx: mpsc::UnboundedSender<LinkNotice>,
    weak_self: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager and the receiver for its notifications
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        config: LinkConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkNotice>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (epoch_tx, _) = watch::channel(0u64);

        let manager = Arc::new_cyclic(|weak_self| Self {
            transport,
            config,
            state_tx,
            epoch_tx,
            slot: Mutex::new(LinkSlot::default()),
            io_lock: Mutex::new(()),
            notice_tx,
            weak_self: weak_self.clone(),
        });
        (manager, notice_rx)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Receiver that observes every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the active link
    pub async fn link(&self) -> Option<Link> {
        self.slot.lock().await.link.clone()
    }

    pub async fn has_role(&self, role: CharacteristicRole) -> bool {
        self.slot.lock().await.registry.contains(role)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!("Connection state: {} -> {}", current, state);
            *current = state;
            true
        });
    }

    /// Epoch of the latest connect or disconnect
    pub fn epoch(&self) -> u64 {
        *self.epoch_tx.borrow()
    }

    /// Advance the epoch, cancelling whatever operation is in flight
    fn begin_operation(&self) -> u64 {
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
        *self.epoch_tx.borrow()
    }

    async fn cancellable<F: Future>(&self, epoch: u64, fut: F) -> Result<F::Output> {
        let mut epoch_rx = self.epoch_tx.subscribe();
        tokio::select! {
            output = fut => Ok(output),
            _ = epoch_rx.wait_for(|current| *current != epoch) => Err(LinkError::Cancelled),
        }
    }

    /// Establish a link, retrying up to the configured number of attempts.
    ///
    /// Returns the state the manager settled in. A concurrent `connect` or
    /// `disconnect` cancels this call, which then returns whatever state the
    /// newer call has set.
    pub async fn connect(&self, target: ConnectTarget, peer: PeerKind) -> ConnectionState {
        let max_attempts = self.config.max_connect_attempts;
        self.connect_with_attempts(target, peer, max_attempts).await
    }

    pub async fn connect_with_attempts(
        &self,
        target: ConnectTarget,
        peer: PeerKind,
        max_attempts: u32,
    ) -> ConnectionState {
        let epoch = self.begin_operation();
        self.teardown().await;
        self.set_state(ConnectionState::Connecting);

        let max_attempts = max_attempts.max(1);
        let mut last_error = LinkError::NotConnected;

        for attempt in 1..=max_attempts {
            info!(
                "Connecting to {} as {:?} ({}), attempt {}/{}",
                target,
                target.role(),
                peer,
                attempt,
                max_attempts
            );

            match self.attempt(&target, peer, epoch).await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    return ConnectionState::Connected;
                }
                Err(LinkError::Cancelled) => {
                    debug!("Connect to {} cancelled", target);
                    return self.state();
                }
                Err(e) => {
                    warn!("Connect attempt {}/{} failed: {}", attempt, max_attempts, e);
                    if let Err(e) = self.transport.disconnect().await {
                        debug!("Cleanup after failed attempt: {}", e);
                    }
                    if self.epoch() != epoch {
                        debug!("Connect to {} superseded during cleanup", target);
                        return self.state();
                    }
                    last_error = e;
                }
            }

            if attempt < max_attempts {
                let backoff = self.config.backoff(attempt);
                debug!("Backing off for {:?}", backoff);
                if self.cancellable(epoch, sleep(backoff)).await.is_err() {
                    return self.state();
                }
            }
        }

        error!(
            "Giving up on {} after {} attempts: {}",
            target, max_attempts, last_error
        );
        let state = ConnectionState::Error(last_error.to_string());
        self.set_state(state.clone());
        state
    }

    async fn attempt(&self, target: &ConnectTarget, peer: PeerKind, epoch: u64) -> Result<()> {
        let connect_timeout = self.config.connect_timeout();

        let address = match target {
            ConnectTarget::Device(address) => {
                self.cancellable(epoch, timeout(connect_timeout, self.transport.connect(address)))
                    .await?
                    .map_err(|_| LinkError::Timeout("connect"))??;
                address.clone()
            }
            ConnectTarget::Incoming => self
                .cancellable(epoch, timeout(connect_timeout, self.transport.accept()))
                .await?
                .map_err(|_| LinkError::Timeout("waiting for peer"))??,
        };
        info!("Transport connected to {}", address);

        self.cancellable(epoch, sleep(self.config.settle_delay()))
            .await?;

        let discovered = self.cancellable(epoch, self.transport.discover()).await??;
        debug!("Discovered {} characteristics", discovered.len());
        let registry = CharacteristicRegistry::resolve(peer, &discovered)?;
        let max_write = self.transport.max_write_len().await?;

        let mut listeners = Vec::new();
        for handle in registry.subscriptions() {
            let Some(role) = registry.notify_role(&handle.uuid) else {
                continue;
            };
            match self.subscribe_with_retry(role, &handle, epoch).await {
                Ok(stream) => listeners.push(self.spawn_listener(epoch, role, stream)),
                Err(LinkError::Cancelled) => {
                    listeners.iter().for_each(JoinHandle::abort);
                    return Err(LinkError::Cancelled);
                }
                Err(e) if is_mandatory(peer, role) => {
                    listeners.iter().for_each(JoinHandle::abort);
                    return Err(e);
                }
                Err(e) => warn!("Continuing without notifications for {}: {}", role, e),
            }
        }

        let mut slot = self.slot.lock().await;
        if self.epoch() != epoch {
            listeners.iter().for_each(JoinHandle::abort);
            return Err(LinkError::Cancelled);
        }

        info!(
            "Link ready: {} ({}), {} roles, max write {} bytes",
            address,
            peer,
            registry.len(),
            max_write
        );
        slot.link = Some(Link {
            role: target.role(),
            peer,
            address,
            max_write,
        });
        slot.registry = registry;
        slot.listeners = listeners;
        slot.monitor = Some(self.spawn_monitor(epoch));
        Ok(())
    }

    async fn subscribe_with_retry(
        &self,
        role: CharacteristicRole,
        handle: &CharacteristicHandle,
        epoch: u64,
    ) -> Result<NotificationStream> {
        let attempts = self.config.subscribe_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let subscribe = async {
                let stream = self.transport.enable_notifications(handle).await?;
                self.transport.write_client_config(handle, true).await?;
                Ok::<_, LinkError>(stream)
            };

            match self.cancellable(epoch, subscribe).await? {
                Ok(stream) => {
                    debug!("Subscribed to {} ({})", role, handle.uuid);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        "Subscribe to {} failed (attempt {}/{}): {}",
                        role, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                self.cancellable(epoch, sleep(self.config.subscribe_retry_delay()))
                    .await?;
            }
        }

        Err(last_error
            .unwrap_or_else(|| LinkError::Transport(format!("could not subscribe to {}", role))))
    }

    fn spawn_listener(
        &self,
        epoch: u64,
        role: CharacteristicRole,
        mut stream: NotificationStream,
    ) -> JoinHandle<()> {
        let notice_tx = self.notice_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                if notice_tx
                    .send(LinkNotice::Notification { epoch, role, data })
                    .is_err()
                {
                    break;
                }
            }
            debug!("Notification stream for {} ended", role);
        })
    }

    fn spawn_monitor(&self, epoch: u64) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let manager = self.weak_self.clone();
        tokio::spawn(async move {
            transport.wait_disconnected().await;
            if let Some(manager) = manager.upgrade() {
                manager.on_link_lost(epoch).await;
            }
        })
    }

    async fn on_link_lost(&self, epoch: u64) {
        let mut slot = self.slot.lock().await;
        if self.epoch() != epoch || slot.link.is_none() {
            return;
        }
        warn!("Link to {:?} lost", slot.link.as_ref().map(|l| &l.address));
        // This task is the monitor; detach rather than abort it
        slot.monitor.take();
        slot.release();
        drop(slot);

        self.set_state(ConnectionState::Disconnected);
        let _ = self.notice_tx.send(LinkNotice::LinkLost { epoch });
    }

    /// Release the link and all notifications. Safe to call in any state.
    pub async fn disconnect(&self) {
        self.begin_operation();
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn teardown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(monitor) = slot.monitor.take() {
            monitor.abort();
        }
        let had_link = slot.link.is_some();
        let subscribed = slot.release();
        drop(slot);

        let in_flight = matches!(self.state(), ConnectionState::Connecting);
        if !had_link && !in_flight {
            return;
        }

        info!("Tearing down link ({} subscriptions)", subscribed.len());
        for handle in &subscribed {
            if let Err(e) = self.transport.write_client_config(handle, false).await {
                debug!("Unsubscribe from {} failed: {}", handle.uuid, e);
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            debug!("Transport disconnect failed: {}", e);
        }
    }

    /// Resolve once the link is connected; fails if it settles anywhere else
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state_rx = self.state_tx.subscribe();
        let state = state_rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_err(|_| LinkError::NotConnected)?;
        if state.is_connected() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    async fn handle_for(&self, role: CharacteristicRole) -> Result<CharacteristicHandle> {
        self.wait_ready().await?;
        let slot = self.slot.lock().await;
        slot.registry.get(role).cloned()
    }

    /// Write one value to the characteristic serving `role`
    pub async fn write(&self, role: CharacteristicRole, data: &[u8]) -> Result<()> {
        let handle = self.handle_for(role).await?;
        let _io = self.io_lock.lock().await;

        let attempts = self.config.write_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.transport.write(&handle, data).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Write to {} failed (attempt {}/{}): {}",
                        role, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(LinkError::NotConnected))
    }

    /// Read the current value of the characteristic serving `role`
    pub async fn read(&self, role: CharacteristicRole) -> Result<Vec<u8>> {
        let handle = self.handle_for(role).await?;
        let _io = self.io_lock.lock().await;
        self.transport.read(&handle).await
    }

    /// Scan the local radio
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DeviceRecord>> {
        let _io = self.io_lock.lock().await;
        self.transport.scan(duration).await
    }
}

fn is_mandatory(peer: PeerKind, role: CharacteristicRole) -> bool {
    role_table(peer)
        .iter()
        .any(|spec| spec.role == role && spec.mandatory)
}

#[async_trait::async_trait]
impl crate::framing::ChunkSink for ConnectionManager {
    async fn write_chunk(&self, role: CharacteristicRole, chunk: &[u8]) -> Result<()> {
        self.write(role, chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::{ConnectBehavior, MockTransport};
    use crate::types::TelemetryKind;
    use std::sync::atomic::Ordering;
    use tokio::time::Instant;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn manager(
        transport: MockTransport,
    ) -> (
        Arc<MockTransport>,
        Arc<ConnectionManager>,
        mpsc::UnboundedReceiver<LinkNotice>,
    ) {
        let transport = Arc::new(transport);
        let (manager, rx) = ConnectionManager::new(transport.clone(), LinkConfig::default());
        (transport, manager, rx)
    }

    fn target() -> ConnectTarget {
        ConnectTarget::Device(ADDRESS.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success() {
        let (transport, manager, _rx) = manager(MockTransport::new(PeerKind::CompanionModule));

        let state = manager.connect(target(), PeerKind::CompanionModule).await;
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(manager.state(), ConnectionState::Connected);

        let link = manager.link().await.unwrap();
        assert_eq!(link.role, LinkRole::Initiator);
        assert_eq!(link.address, ADDRESS);
        assert_eq!(link.max_write, 20);

        // One subscription and one descriptor write per notifying characteristic
        assert_eq!(transport.subscribe_calls.load(Ordering::SeqCst), 12);
        assert_eq!(transport.client_config_writes.lock().unwrap().len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_as_acceptor() {
        let (_transport, manager, _rx) = manager(MockTransport::new(PeerKind::PeerApplication));
        let state = manager
            .connect(ConnectTarget::Incoming, PeerKind::PeerApplication)
            .await;
        assert_eq!(state, ConnectionState::Connected);
        let link = manager.link().await.unwrap();
        assert_eq!(link.role, LinkRole::Acceptor);
        assert_eq!(link.address, "11:22:33:44:55:66");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_with_linear_backoff() {
        let (transport, manager, _rx) = manager(
            MockTransport::new(PeerKind::CompanionModule).with_behavior(ConnectBehavior::Hang),
        );

        let start = Instant::now();
        let state = manager.connect(target(), PeerKind::CompanionModule).await;
        let elapsed = start.elapsed();

        assert_eq!(state, ConnectionState::Error("Timed out: connect".to_string()));
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 3);
        // Three 10 s timeouts plus backoffs of 2 s and 4 s
        assert!(elapsed >= Duration::from_secs(36), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(37), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_connect_reports_last_reason() {
        let (transport, manager, _rx) = manager(
            MockTransport::new(PeerKind::CompanionModule).with_behavior(ConnectBehavior::Reject),
        );
        let state = manager
            .connect_with_attempts(target(), PeerKind::CompanionModule, 2)
            .await;
        assert_eq!(
            state,
            ConnectionState::Error("Transport error: connection refused".to_string())
        );
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_mandatory_role() {
        let (transport, manager, _rx) = manager(
            MockTransport::new(PeerKind::CompanionModule)
                .without_role(PeerKind::CompanionModule, CharacteristicRole::TextWrite),
        );
        let state = manager.connect(target(), PeerKind::CompanionModule).await;
        assert_eq!(
            state,
            ConnectionState::Error("missing capability: text-write".to_string())
        );
        // Discovery failure counts toward the attempt budget
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 3);
        assert!(manager.link().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_retries_then_succeeds() {
        let transport = MockTransport::new(PeerKind::PeerApplication);
        transport.subscribe_failures.store(2, Ordering::SeqCst);
        let (transport, manager, _rx) = manager(transport);

        let state = manager.connect(target(), PeerKind::PeerApplication).await;
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(transport.subscribe_calls.load(Ordering::SeqCst), 3);
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mandatory_subscribe_failure_fails_attempt() {
        let transport = MockTransport::new(PeerKind::PeerApplication);
        transport.subscribe_failures.store(3, Ordering::SeqCst);
        let (transport, manager, _rx) = manager(transport);

        let state = manager.connect(target(), PeerKind::PeerApplication).await;
        assert_eq!(state, ConnectionState::Connected);
        // First attempt exhausted its subscribe budget, second attempt succeeded
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.subscribe_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let (transport, manager, _rx) = manager(MockTransport::new(PeerKind::CompanionModule));

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.disconnect_calls.load(Ordering::SeqCst), 0);

        manager.connect(target(), PeerKind::CompanionModule).await;
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.disconnect_calls.load(Ordering::SeqCst), 1);
        assert!(manager.link().await.is_none());

        let unsubscribed = transport
            .client_config_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, enable)| !enable)
            .count();
        assert_eq!(unsubscribed, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_in_flight_connect() {
        let (_transport, manager, _rx) = manager(
            MockTransport::new(PeerKind::CompanionModule).with_behavior(ConnectBehavior::Hang),
        );

        let connecting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect(target(), PeerKind::CompanionModule).await })
        };

        sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let start = Instant::now();
        manager.disconnect().await;
        let state = connecting.await.unwrap();
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_failed_attempt_cleanup() {
        let transport =
            MockTransport::new(PeerKind::CompanionModule).with_behavior(ConnectBehavior::Reject);
        transport.slow_disconnects.store(1, Ordering::SeqCst);
        let (transport, manager, _rx) = manager(transport);

        let connecting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .connect_with_attempts(target(), PeerKind::CompanionModule, 1)
                    .await
            })
        };

        // The rejected attempt is still cleaning up when the user disconnects
        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.disconnect().await;

        let state = connecting.await.unwrap();
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_current_value() {
        let (transport, manager, _rx) = manager(MockTransport::new(PeerKind::CompanionModule));
        let humidity = CharacteristicRole::Telemetry(TelemetryKind::Humidity);
        transport.reads.lock().unwrap().insert(
            MockTransport::uuid_of(PeerKind::CompanionModule, humidity),
            vec![0x00, 0x64],
        );

        assert!(matches!(
            manager.read(humidity).await,
            Err(LinkError::NotConnected)
        ));
        manager.connect(target(), PeerKind::CompanionModule).await;
        assert_eq!(manager.read(humidity).await.unwrap(), vec![0x00, 0x64]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_are_tagged_by_role() {
        let (transport, manager, mut rx) = manager(MockTransport::new(PeerKind::CompanionModule));
        manager.connect(target(), PeerKind::CompanionModule).await;

        let epoch = manager.epoch();

        let humidity = CharacteristicRole::Telemetry(TelemetryKind::Humidity);
        let uuid = MockTransport::uuid_of(PeerKind::CompanionModule, humidity);
        assert!(transport.notify(&uuid, &[0x00, 0x64]));
        assert!(transport.notify(&uuid, &[0x00, 0x65]));

        assert_eq!(
            rx.recv().await,
            Some(LinkNotice::Notification {
                epoch,
                role: humidity,
                data: vec![0x00, 0x64]
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(LinkNotice::Notification {
                epoch,
                role: humidity,
                data: vec![0x00, 0x65]
            })
        );

        // A new link gets a new epoch
        manager.connect(target(), PeerKind::CompanionModule).await;
        assert!(manager.epoch() > epoch);
        assert!(transport.notify(&uuid, &[0x00, 0x66]));
        assert_eq!(rx.recv().await.map(|notice| notice.epoch()), Some(manager.epoch()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_releases_link() {
        let (transport, manager, mut rx) = manager(MockTransport::new(PeerKind::CompanionModule));
        manager.connect(target(), PeerKind::CompanionModule).await;
        let epoch = manager.epoch();

        transport.drop_link();
        assert_eq!(rx.recv().await, Some(LinkNotice::LinkLost { epoch }));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.link().await.is_none());
        assert!(matches!(
            manager.write(CharacteristicRole::TextWrite, b"x").await,
            Err(LinkError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waits_for_connection() {
        let (transport, manager, _rx) = manager(MockTransport::new(PeerKind::CompanionModule));

        let connecting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect(target(), PeerKind::CompanionModule).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager
            .write(CharacteristicRole::TextWrite, b"queued")
            .await
            .unwrap();
        assert_eq!(connecting.await.unwrap(), ConnectionState::Connected);

        let uuid = MockTransport::uuid_of(PeerKind::CompanionModule, CharacteristicRole::TextWrite);
        assert_eq!(transport.written_to(&uuid), vec![b"queued".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retries_and_missing_role() {
        let transport = MockTransport::new(PeerKind::CompanionModule)
            .without_role(PeerKind::CompanionModule, CharacteristicRole::VoiceWrite);
        transport.write_failures.store(1, Ordering::SeqCst);
        let (transport, manager, _rx) = manager(transport);
        manager.connect(target(), PeerKind::CompanionModule).await;

        manager.write(CharacteristicRole::TextWrite, b"hi").await.unwrap();
        assert_eq!(transport.written().len(), 1);

        assert!(matches!(
            manager.write(CharacteristicRole::VoiceWrite, b"hi").await,
            Err(LinkError::CapabilityMissing(CharacteristicRole::VoiceWrite))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_tears_down_previous_link() {
        let (transport, manager, _rx) = manager(MockTransport::new(PeerKind::CompanionModule));
        manager.connect(target(), PeerKind::CompanionModule).await;
        let state = manager.connect(target(), PeerKind::CompanionModule).await;
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(transport.disconnect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 2);
    }
}
