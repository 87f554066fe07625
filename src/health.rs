//! Link health monitoring
//!
//! Tracks inbound traffic and link-loss events so the application can tell a
//! live link from a stalled one and decide when to reconnect:
//! - records RX timestamps from every notification
//! - flags links without traffic past the stall timeout
//! - counts reconnect attempts with linear backoff

use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Reasons why a reconnection was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// The transport reported the link as lost
    ConnectionLost,
    /// No inbound traffic within the stall timeout
    Stalled,
    /// Requested by the user
    Manual,
}

impl std::fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectReason::ConnectionLost => write!(f, "Connection Lost"),
            ReconnectReason::Stalled => write!(f, "Stalled"),
            ReconnectReason::Manual => write!(f, "Manual"),
        }
    }
}

/// Health status of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Approaching the stall timeout
    Degraded,
    /// Past the stall timeout
    Unhealthy,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
            HealthStatus::Reconnecting => write!(f, "Reconnecting"),
            HealthStatus::Disconnected => write!(f, "Disconnected"),
        }
    }
}

struct HealthState {
    last_rx: Option<Instant>,
    connection_start: Option<Instant>,
    /// Consecutive reconnect attempts since the last established link
    reconnect_attempts: u32,
    total_reconnects: u64,
    rx_packets: u64,
    last_reconnect_reason: Option<ReconnectReason>,
    health_status: HealthStatus,
    link_lost: bool,
}

impl HealthState {
    fn new() -> Self {
        Self {
            last_rx: None,
            connection_start: None,
            reconnect_attempts: 0,
            total_reconnects: 0,
            rx_packets: 0,
            last_reconnect_reason: None,
            health_status: HealthStatus::Disconnected,
            link_lost: false,
        }
    }
}

/// Health monitor for the active link
#[derive(Clone)]
pub struct LinkHealth {
    stall_timeout: Duration,
    backoff_step: Duration,
    state: Arc<Mutex<HealthState>>,
}

impl LinkHealth {
    pub fn new(stall_timeout: Duration, backoff_step: Duration) -> Self {
        Self {
            stall_timeout,
            backoff_step,
            state: Arc::new(Mutex::new(HealthState::new())),
        }
    }

    /// Record that a notification was received
    pub async fn record_rx(&self) {
        let mut state = self.state.lock().await;
        state.last_rx = Some(Instant::now());
        state.rx_packets += 1;
        if state.health_status == HealthStatus::Degraded
            || state.health_status == HealthStatus::Unhealthy
        {
            state.health_status = HealthStatus::Healthy;
        }
    }

    /// Mark that the link reached the connected state
    pub async fn mark_connected(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.connection_start = Some(now);
        state.last_rx = Some(now);
        state.health_status = HealthStatus::Healthy;
        state.reconnect_attempts = 0;
        state.link_lost = false;
    }

    /// Mark that the link went away. `lost` is false for a requested disconnect.
    pub async fn mark_disconnected(&self, lost: bool) {
        let mut state = self.state.lock().await;
        if lost {
            debug!("Link health: connection lost");
        }
        state.health_status = HealthStatus::Disconnected;
        state.connection_start = None;
        state.link_lost = lost;
    }

    /// Mark that a reconnection is starting and return the backoff to apply
    pub async fn mark_reconnecting(&self, reason: ReconnectReason) -> Duration {
        let mut state = self.state.lock().await;
        state.health_status = HealthStatus::Reconnecting;
        state.link_lost = false;
        state.last_reconnect_reason = Some(reason);
        state.reconnect_attempts += 1;
        state.total_reconnects += 1;
        self.backoff_step * state.reconnect_attempts
    }

    /// Check link health
    pub async fn check_health(&self, is_connected: bool) -> HealthStatus {
        let mut state = self.state.lock().await;

        if state.health_status == HealthStatus::Reconnecting {
            return HealthStatus::Reconnecting;
        }

        if !is_connected {
            state.health_status = HealthStatus::Disconnected;
            return HealthStatus::Disconnected;
        }

        let status = match state.last_rx {
            Some(last_rx) if last_rx.elapsed() >= self.stall_timeout => HealthStatus::Unhealthy,
            Some(last_rx) if last_rx.elapsed() >= self.stall_timeout * 9 / 10 => {
                HealthStatus::Degraded
            }
            _ => HealthStatus::Healthy,
        };
        state.health_status = status;
        status
    }

    /// Determine if reconnection is needed and why
    pub async fn should_reconnect(&self, is_connected: bool) -> Option<ReconnectReason> {
        let link_lost = self.state.lock().await.link_lost;
        if link_lost {
            return Some(ReconnectReason::ConnectionLost);
        }
        match self.check_health(is_connected).await {
            HealthStatus::Unhealthy => Some(ReconnectReason::Stalled),
            _ => None,
        }
    }

    /// Get current health metrics
    pub async fn metrics(&self) -> HealthMetrics {
        let state = self.state.lock().await;
        HealthMetrics {
            health_status: state.health_status,
            uptime: state.connection_start.map(|start| start.elapsed()),
            last_rx_elapsed: state.last_rx.map(|last| last.elapsed()),
            rx_packets: state.rx_packets,
            reconnect_attempts: state.reconnect_attempts,
            total_reconnects: state.total_reconnects,
            last_reconnect_reason: state.last_reconnect_reason,
        }
    }
}

/// Health metrics snapshot
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub health_status: HealthStatus,
    pub uptime: Option<Duration>,
    pub last_rx_elapsed: Option<Duration>,
    pub rx_packets: u64,
    pub reconnect_attempts: u32,
    pub total_reconnects: u64,
    pub last_reconnect_reason: Option<ReconnectReason>,
}

impl std::fmt::Display for HealthMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Link Health:")?;
        writeln!(f, "  Status: {}", self.health_status)?;
        writeln!(f, "  Uptime: {:?}", self.uptime)?;
        writeln!(f, "  Last RX: {:?} ago", self.last_rx_elapsed)?;
        writeln!(f, "  RX Packets: {}", self.rx_packets)?;
        writeln!(f, "  Reconnect Attempts: {}", self.reconnect_attempts)?;
        writeln!(f, "  Total Reconnects: {}", self.total_reconnects)?;
        writeln!(
            f,
            "  Last Reconnect Reason: {:?}",
            self.last_reconnect_reason
        )?;
        Ok(())
    }
}
