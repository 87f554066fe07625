//! In-memory [`LinkTransport`] used by the unit tests

use crate::connection::{LinkTransport, NotificationStream};
use crate::registry::{role_table, CharacteristicHandle};
use crate::types::{CharacteristicRole, DeviceRecord, LinkError, PeerKind, Result};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

pub const SLOW_DISCONNECT: Duration = Duration::from_millis(100);

/// How the mock answers connect requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    /// Never report "connected"
    Hang,
    Reject,
}

pub struct MockTransport {
    pub connect_behavior: Mutex<ConnectBehavior>,
    pub discovered: Mutex<Vec<CharacteristicHandle>>,
    pub max_write: usize,
    pub scan_results: Vec<DeviceRecord>,
    /// Number of upcoming enable_notifications calls that fail
    pub subscribe_failures: AtomicUsize,
    /// Number of upcoming writes that fail
    pub write_failures: AtomicUsize,
    /// Number of upcoming disconnects that take [`SLOW_DISCONNECT`]
    pub slow_disconnects: AtomicUsize,
    pub connect_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub client_config_writes: Mutex<Vec<(String, bool)>>,
    pub writes: Mutex<Vec<(String, Vec<u8>)>>,
    pub reads: Mutex<HashMap<String, Vec<u8>>>,
    notifiers: Mutex<HashMap<String, UnboundedSender<Vec<u8>>>>,
    lost: Notify,
}

impl MockTransport {
    pub fn new(peer: PeerKind) -> Self {
        let discovered = role_table(peer)
            .into_iter()
            .map(|spec| CharacteristicHandle::new(spec.uuid))
            .collect();
        Self {
            connect_behavior: Mutex::new(ConnectBehavior::Succeed),
            discovered: Mutex::new(discovered),
            max_write: 20,
            scan_results: Vec::new(),
            subscribe_failures: AtomicUsize::new(0),
            write_failures: AtomicUsize::new(0),
            slow_disconnects: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            client_config_writes: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            reads: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
            lost: Notify::new(),
        }
    }

    pub fn with_behavior(self, behavior: ConnectBehavior) -> Self {
        *self.connect_behavior.lock().unwrap() = behavior;
        self
    }

    pub fn without_role(self, peer: PeerKind, role: CharacteristicRole) -> Self {
        let uuid = role_table(peer)
            .into_iter()
            .find(|spec| spec.role == role)
            .map(|spec| spec.uuid.to_uppercase());
        if let Some(uuid) = uuid {
            self.discovered.lock().unwrap().retain(|h| h.uuid != uuid);
        }
        self
    }

    pub fn uuid_of(peer: PeerKind, role: CharacteristicRole) -> String {
        role_table(peer)
            .into_iter()
            .find(|spec| spec.role == role)
            .map(|spec| spec.uuid.to_uppercase())
            .unwrap_or_default()
    }

    /// Deliver a value on a subscribed characteristic
    pub fn notify(&self, uuid: &str, value: &[u8]) -> bool {
        match self.notifiers.lock().unwrap().get(uuid) {
            Some(tx) => tx.unbounded_send(value.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Simulate the remote side dropping the link
    pub fn drop_link(&self) {
        self.lost.notify_one();
    }

    pub fn written(&self) -> Vec<(String, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn written_to(&self, uuid: &str) -> Vec<Vec<u8>> {
        self.written()
            .into_iter()
            .filter(|(u, _)| u == uuid)
            .map(|(_, data)| data)
            .collect()
    }
}

#[async_trait::async_trait]
impl LinkTransport for MockTransport {
    async fn scan(&self, duration: Duration) -> Result<Vec<DeviceRecord>> {
        tokio::time::sleep(duration).await;
        Ok(self.scan_results.clone())
    }

    async fn connect(&self, _address: &str) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.connect_behavior.lock().unwrap();
        match behavior {
            ConnectBehavior::Succeed => Ok(()),
            ConnectBehavior::Hang => std::future::pending().await,
            ConnectBehavior::Reject => Err(LinkError::Transport("connection refused".to_string())),
        }
    }

    async fn accept(&self) -> Result<String> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.connect_behavior.lock().unwrap();
        match behavior {
            ConnectBehavior::Succeed => Ok("11:22:33:44:55:66".to_string()),
            ConnectBehavior::Hang => std::future::pending().await,
            ConnectBehavior::Reject => Err(LinkError::Transport("advertising failed".to_string())),
        }
    }

    async fn discover(&self) -> Result<Vec<CharacteristicHandle>> {
        Ok(self.discovered.lock().unwrap().clone())
    }

    async fn max_write_len(&self) -> Result<usize> {
        Ok(self.max_write)
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        Ok(self
            .reads
            .lock()
            .unwrap()
            .get(&handle.uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, handle: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        let pending_failures = self.write_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.write_failures.store(pending_failures - 1, Ordering::SeqCst);
            return Err(LinkError::Transport("write rejected".to_string()));
        }
        self.writes
            .lock()
            .unwrap()
            .push((handle.uuid.clone(), data.to_vec()));
        // Yield so concurrent senders get a chance to interleave if they could
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn enable_notifications(
        &self,
        handle: &CharacteristicHandle,
    ) -> Result<NotificationStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let pending_failures = self.subscribe_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.subscribe_failures
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(LinkError::Transport("notify rejected".to_string()));
        }
        let (tx, rx) = unbounded();
        self.notifiers
            .lock()
            .unwrap()
            .insert(handle.uuid.clone(), tx);
        Ok(Box::pin(rx))
    }

    async fn write_client_config(&self, handle: &CharacteristicHandle, enable: bool) -> Result<()> {
        self.client_config_writes
            .lock()
            .unwrap()
            .push((handle.uuid.clone(), enable));
        Ok(())
    }

    async fn wait_disconnected(&self) {
        self.lost.notified().await;
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let pending_slow = self.slow_disconnects.load(Ordering::SeqCst);
        if pending_slow > 0 {
            self.slow_disconnects.store(pending_slow - 1, Ordering::SeqCst);
            tokio::time::sleep(SLOW_DISCONNECT).await;
        }
        self.notifiers.lock().unwrap().clear();
        Ok(())
    }
}
