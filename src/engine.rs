//! Protocol engine
//!
//! Message-level façade used by the application. It composes the connection
//! manager, the framing codec, the telemetry decoder and the scan-list parser,
//! and reports everything that happens on the link as [`LinkEvent`]s.
//!
//! Inbound notifications are handled by a single dispatch task in arrival
//! order, so reassembly buffers always see the chunks of one characteristic in
//! the order the transport delivered them. Outbound messages hold a per-stream
//! lock for the whole send, so two messages on the same stream never interleave.

use crate::config::LinkConfig;
use crate::connection::{ConnectionManager, Link, LinkNotice, LinkTransport};
use crate::framing::{encode_message, send_frames, Inbound, PayloadKind, Reassembler};
use crate::health::{HealthMetrics, LinkHealth, ReconnectReason};
use crate::scan_list::{RosterUpdate, ScanListParser, ScanRoster, SCAN_TRIGGER};
use crate::telemetry::{self, TelemetrySample};
use crate::types::{
    CharacteristicRole, ConnectTarget, ConnectionState, DeviceRecord, LinkError, PeerKind, Result,
    TelemetryKind,
};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Everything the application observes about the link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    ConnectionStateChanged(ConnectionState),
    TextMessage { text: String, from_self: bool },
    VoiceMessage { data: Vec<u8>, from_self: bool },
    Telemetry(TelemetrySample),
    ScanRosterUpdated { roster: ScanRoster, complete: bool },
    Error(String),
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

struct InboundState {
    address: String,
    /// Link epoch the reassembly buffers belong to
    epoch: u64,
    reassembler: Reassembler,
    scan: ScanListParser,
    scan_timer: Option<JoinHandle<()>>,
}

impl InboundState {
    fn new() -> Self {
        Self {
            address: String::new(),
            epoch: 0,
            reassembler: Reassembler::new(PeerKind::CompanionModule.framing()),
            scan: ScanListParser::new(),
            scan_timer: None,
        }
    }

    fn cancel_scan_timer(&mut self) {
        if let Some(timer) = self.scan_timer.take() {
            timer.abort();
        }
    }

    /// Finalize an open scan session with whatever has arrived
    fn abandon_scan(&mut self) -> Option<RosterUpdate> {
        self.cancel_scan_timer();
        self.scan.on_timeout()
    }
}

/// State shared between the engine and its background tasks
struct Shared {
    manager: Arc<ConnectionManager>,
    inbound: Mutex<InboundState>,
    health: LinkHealth,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Shared {
    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn emit_roster(&self, update: RosterUpdate) {
        self.emit(LinkEvent::ScanRosterUpdated {
            roster: update.roster,
            complete: update.complete,
        });
    }

    fn emit_inbound(&self, message: Inbound) {
        match message {
            Inbound::Text(text) => {
                info!("Received text message ({} bytes)", text.len());
                self.emit(LinkEvent::TextMessage {
                    text,
                    from_self: false,
                });
            }
            Inbound::Voice(data) => {
                info!("Received voice message ({} bytes)", data.len());
                self.emit(LinkEvent::VoiceMessage {
                    data,
                    from_self: false,
                });
            }
            Inbound::Malformed { kind, reason } => {
                self.emit(LinkEvent::Error(format!(
                    "dropped undecodable {:?} message: {}",
                    kind, reason
                )));
            }
        }
    }

    async fn handle_notice(self: &Arc<Self>, notice: LinkNotice) {
        if notice.epoch() != self.manager.epoch() {
            debug!("Dropping {:?} from a superseded link", notice);
            return;
        }

        match notice {
            LinkNotice::Notification { epoch, role, data } => {
                self.health.record_rx().await;
                debug!("RX {} ({} bytes): {}", role, data.len(), hex(&data));

                let mut inbound = self.inbound.lock().await;
                if epoch != inbound.epoch {
                    // First chunk of a new link; anything buffered is from the old one
                    inbound.epoch = epoch;
                    inbound.reassembler.reset();
                }
                match role {
                    CharacteristicRole::TextNotify => {
                        if let Some(message) = inbound.reassembler.on_chunk(PayloadKind::Text, &data) {
                            self.emit_inbound(message);
                        }
                    }
                    CharacteristicRole::VoiceNotify => {
                        if let Some(message) = inbound.reassembler.on_chunk(PayloadKind::Voice, &data)
                        {
                            self.emit_inbound(message);
                        }
                    }
                    CharacteristicRole::ScanList => {
                        let was_active = inbound.scan.is_active();
                        let update = inbound.scan.on_fragment(&data);
                        if !was_active && inbound.scan.is_active() && inbound.scan_timer.is_none() {
                            let bound = self.manager.config().scan_timeout();
                            debug!("Module-initiated scan; finalizing within {:?}", bound);
                            inbound.scan_timer = Some(spawn_scan_timer(self, bound));
                        }
                        if let Some(update) = update {
                            if update.complete {
                                inbound.cancel_scan_timer();
                            }
                            self.emit_roster(update);
                        }
                    }
                    CharacteristicRole::ScanControl => {
                        if let Some(update) = inbound.scan.on_scan_state(&data) {
                            inbound.cancel_scan_timer();
                            self.emit_roster(update);
                        }
                    }
                    CharacteristicRole::Telemetry(kind) => {
                        match telemetry::decode(kind, &data, &inbound.address) {
                            Some(sample) => self.emit(LinkEvent::Telemetry(sample)),
                            None => warn!("Dropped malformed {} packet: {}", kind, hex(&data)),
                        }
                    }
                    CharacteristicRole::TextWrite | CharacteristicRole::VoiceWrite => {
                        debug!("Ignoring notification on write role {}", role);
                    }
                }
            }
            LinkNotice::LinkLost { .. } => {
                self.health.mark_disconnected(true).await;
                let mut inbound = self.inbound.lock().await;
                inbound.reassembler.reset();
                if let Some(update) = inbound.abandon_scan() {
                    self.emit_roster(update);
                }
                drop(inbound);
                self.emit(LinkEvent::Error("link lost".to_string()));
            }
        }
    }
}

fn spawn_scan_timer(shared: &Arc<Shared>, bound: Duration) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(bound).await;
        let mut inbound = shared.inbound.lock().await;
        inbound.scan_timer = None;
        if let Some(update) = inbound.scan.on_timeout() {
            warn!("Scan not finished after {:?}; using partial roster", bound);
            shared.emit_roster(update);
        }
    })
}

/// Message-level operations on a single link
pub struct ProtocolEngine {
    manager: Arc<ConnectionManager>,
    shared: Arc<Shared>,
    text_send: Mutex<()>,
    voice_send: Mutex<()>,
    /// Target and peer kind of the latest connect, for reconnects
    last_target: Mutex<Option<(ConnectTarget, PeerKind)>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProtocolEngine {
    /// Create an engine and the receiver for its events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        config: LinkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let health = LinkHealth::new(config.stall_timeout(), config.backoff_step());
        let (manager, mut notices) = ConnectionManager::new(transport, config);
        let (events, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            manager: Arc::clone(&manager),
            inbound: Mutex::new(InboundState::new()),
            health,
            events,
        });

        let dispatch = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Some(notice) = notices.recv().await {
                    shared.handle_notice(notice).await;
                }
            })
        };

        let state_watch = {
            let shared = Arc::clone(&shared);
            let mut state_rx = manager.subscribe_state();
            tokio::spawn(async move {
                while state_rx.changed().await.is_ok() {
                    let state = state_rx.borrow_and_update().clone();
                    shared.emit(LinkEvent::ConnectionStateChanged(state));
                }
            })
        };

        let engine = Self {
            manager,
            shared,
            text_send: Mutex::new(()),
            voice_send: Mutex::new(()),
            last_target: Mutex::new(None),
            tasks: vec![dispatch, state_watch],
        };
        (engine, event_rx)
    }

    pub fn config(&self) -> &LinkConfig {
        self.manager.config()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub async fn link(&self) -> Option<Link> {
        self.manager.link().await
    }

    /// Handle to the health monitor, for reconnect supervision
    pub fn health(&self) -> LinkHealth {
        self.shared.health.clone()
    }

    pub async fn metrics(&self) -> HealthMetrics {
        self.shared.health.metrics().await
    }

    /// Latest companion scan roster
    pub async fn roster(&self) -> ScanRoster {
        self.shared.inbound.lock().await.scan.roster().clone()
    }

    /// Connect to a peer. Cancels any connect or scan in flight.
    pub async fn connect(&self, target: ConnectTarget, peer: PeerKind) -> ConnectionState {
        *self.last_target.lock().await = Some((target.clone(), peer));
        {
            let mut inbound = self.shared.inbound.lock().await;
            if let Some(update) = inbound.abandon_scan() {
                self.shared.emit_roster(update);
            }
            inbound.scan.reset();
            inbound.reassembler = Reassembler::new(peer.framing());
            if let ConnectTarget::Device(address) = &target {
                inbound.address = address.clone();
            }
        }

        let state = self.manager.connect(target, peer).await;
        if state.is_connected() {
            if let Some(link) = self.manager.link().await {
                self.shared.inbound.lock().await.address = link.address;
            }
            self.shared.health.mark_connected().await;
        }
        state
    }

    /// Connect again to the latest target after the backoff for `reason`.
    ///
    /// Fails with [`LinkError::NotConnected`] if `connect` was never called.
    pub async fn reconnect(&self, reason: ReconnectReason) -> Result<ConnectionState> {
        let (target, peer) = self
            .last_target
            .lock()
            .await
            .clone()
            .ok_or(LinkError::NotConnected)?;

        let backoff = self.shared.health.mark_reconnecting(reason).await;
        warn!("Reconnecting to {} ({}) in {:?}", target, reason, backoff);
        tokio::time::sleep(backoff).await;
        Ok(self.connect(target, peer).await)
    }

    /// Release the link. Any open scan session is finalized with partial data.
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
        self.shared.health.mark_disconnected(false).await;

        let mut inbound = self.shared.inbound.lock().await;
        inbound.reassembler.reset();
        if let Some(update) = inbound.abandon_scan() {
            self.shared.emit_roster(update);
        }
    }

    /// Send a text message. Waits for the link to become ready.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Err(LinkError::EmptyMessage);
        }
        let _stream = self.text_send.lock().await;
        self.send_payload(PayloadKind::Text, CharacteristicRole::TextWrite, text.as_bytes())
            .await?;
        self.shared.emit(LinkEvent::TextMessage {
            text: text.to_string(),
            from_self: true,
        });
        Ok(())
    }

    /// Send an opaque voice blob. Waits for the link to become ready.
    pub async fn send_voice(&self, blob: &[u8]) -> Result<()> {
        if blob.is_empty() {
            return Err(LinkError::EmptyMessage);
        }
        let _stream = self.voice_send.lock().await;
        self.send_payload(PayloadKind::Voice, CharacteristicRole::VoiceWrite, blob)
            .await?;
        self.shared.emit(LinkEvent::VoiceMessage {
            data: blob.to_vec(),
            from_self: true,
        });
        Ok(())
    }

    async fn send_payload(
        &self,
        kind: PayloadKind,
        role: CharacteristicRole,
        payload: &[u8],
    ) -> Result<()> {
        self.manager.wait_ready().await?;
        let link = self.manager.link().await.ok_or(LinkError::NotConnected)?;
        if !self.manager.has_role(role).await {
            return Err(LinkError::CapabilityMissing(role));
        }

        let frames = encode_message(link.peer.framing(), kind, payload, link.max_write)?;
        debug!(
            "Sending {:?} message: {} bytes in {} chunks",
            kind,
            payload.len(),
            frames.len()
        );

        let pause = self.manager.config().chunk_pause();
        if let Err(e) = send_frames(&*self.manager, role, &frames, pause).await {
            warn!(
                "{:?} message of {} bytes not delivered: {}",
                kind,
                payload.len(),
                e
            );
            return Err(e);
        }
        Ok(())
    }

    /// Read the current value of a telemetry characteristic.
    ///
    /// Returns `None` when the value is too short to decode.
    pub async fn read_telemetry(&self, kind: TelemetryKind) -> Result<Option<TelemetrySample>> {
        let raw = self.manager.read(CharacteristicRole::Telemetry(kind)).await?;
        let address = self.shared.inbound.lock().await.address.clone();
        let sample = telemetry::decode(kind, &raw, &address);
        if sample.is_none() {
            warn!("Unreadable {} value: {}", kind, hex(&raw));
        }
        Ok(sample)
    }

    /// Ask the companion to scan its radio.
    ///
    /// Clears the previous roster. Results arrive as `ScanRosterUpdated` events;
    /// the session is finalized with partial data when the scan timeout elapses.
    pub async fn request_scan(&self) -> Result<()> {
        {
            let mut inbound = self.shared.inbound.lock().await;
            inbound.cancel_scan_timer();
            inbound.scan.begin_session();
            inbound.scan_timer = Some(spawn_scan_timer(
                &self.shared,
                self.manager.config().scan_timeout(),
            ));
        }
        self.shared.emit_roster(RosterUpdate {
            roster: ScanRoster::default(),
            complete: false,
        });

        info!("Requesting companion scan");
        if let Err(e) = self
            .manager
            .write(CharacteristicRole::ScanControl, &[SCAN_TRIGGER])
            .await
        {
            warn!("Scan request failed: {}", e);
            let update = self.shared.inbound.lock().await.abandon_scan();
            if let Some(update) = update {
                self.shared.emit_roster(update);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Tell the companion to connect to the device at `index` of the last roster
    pub async fn select_device(&self, index: usize) -> Result<DeviceRecord> {
        let device = self.shared.inbound.lock().await.scan.roster().get(index).cloned();
        let device =
            device.ok_or_else(|| LinkError::Protocol(format!("no device at index {}", index)))?;
        let selector = u8::try_from(index)
            .map_err(|_| LinkError::Protocol(format!("device index {} exceeds one byte", index)))?;

        self.manager
            .write(CharacteristicRole::ScanControl, &[selector])
            .await?;
        info!("Selected device {} ({})", device.name, device.address);
        Ok(device)
    }

    /// Scan the local radio.
    ///
    /// Named devices found here keep their real address in later companion
    /// rosters. A failed scan yields an empty roster.
    pub async fn scan_local(&self) -> ScanRoster {
        let bound = self.manager.config().local_scan_timeout();
        info!("Scanning local radio for {:?}", bound);

        let found = match self.manager.scan(bound).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Local scan failed: {}", e);
                Vec::new()
            }
        };

        let mut seen = HashSet::new();
        let devices: Vec<DeviceRecord> = found
            .into_iter()
            .filter(|device| seen.insert(device.address.clone()))
            .collect();

        let mut inbound = self.shared.inbound.lock().await;
        for device in devices.iter().filter(|device| !device.name.is_empty()) {
            inbound.scan.remember_address(&device.name, &device.address);
        }
        info!("Local scan found {} devices", devices.len());
        ScanRoster { devices }
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
