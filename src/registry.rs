//! Characteristic registry
//!
//! Maps each [`CharacteristicRole`] to the remote characteristic that serves it on
//! the current link. The registry is built once per connection from the
//! discovered characteristics and the role table of the peer kind, and dropped
//! on disconnect.

use crate::types::{CharacteristicRole, LinkError, PeerKind, Result, TelemetryKind};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};

/// UUID format for the companion module's 16-bit characteristic codes
pub const MODULE_UUID_FORMAT: &str = "0000%04X-0000-1000-8000-00805F9B34FB";

/// UUID format for the peer application's message service
pub const PEER_APP_UUID_FORMAT: &str = "6E40%04X-B5A3-F393-E0A9-E50E24DCCA9E";

/// Handle to a remote characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub uuid: String,
}

impl CharacteristicHandle {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into().to_uppercase(),
        }
    }
}

/// Expected characteristic for one role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub role: CharacteristicRole,
    pub uuid: String,
    pub mandatory: bool,
}

fn uuid_for(format: &str, code: u16) -> String {
    format.replace("%04X", &format!("{:04X}", code))
}

fn telemetry_code(kind: TelemetryKind) -> u16 {
    match kind {
        TelemetryKind::Accelerometer => 0xFFF1,
        TelemetryKind::Gyroscope => 0xFFF2,
        TelemetryKind::MotionAccelerometer => 0xFFF3,
        TelemetryKind::Magnetometer => 0xFFF4,
        TelemetryKind::AirPressure => 0xFFF5,
        TelemetryKind::Temperature => 0xFFF6,
        TelemetryKind::Humidity => 0xFFF7,
        TelemetryKind::AirQuality => 0xFFF8,
    }
}

/// Characteristics a peer of the given kind is expected to expose
pub fn role_table(peer: PeerKind) -> Vec<RoleSpec> {
    let spec = |role, format, code, mandatory| RoleSpec {
        role,
        uuid: uuid_for(format, code),
        mandatory,
    };

    match peer {
        PeerKind::CompanionModule => {
            let mut table = vec![
                spec(CharacteristicRole::TextWrite, MODULE_UUID_FORMAT, 0xFFE1, true),
                spec(CharacteristicRole::TextNotify, MODULE_UUID_FORMAT, 0xFFE2, true),
                spec(CharacteristicRole::VoiceWrite, MODULE_UUID_FORMAT, 0xFFE3, false),
                spec(CharacteristicRole::VoiceNotify, MODULE_UUID_FORMAT, 0xFFE4, false),
                spec(CharacteristicRole::ScanControl, MODULE_UUID_FORMAT, 0xFFE5, false),
                spec(CharacteristicRole::ScanList, MODULE_UUID_FORMAT, 0xFFE6, false),
            ];
            table.extend(TelemetryKind::ALL.iter().map(|&kind| {
                spec(
                    CharacteristicRole::Telemetry(kind),
                    MODULE_UUID_FORMAT,
                    telemetry_code(kind),
                    false,
                )
            }));
            table
        }
        // Text and voice share one characteristic pair, told apart by frame tags
        PeerKind::PeerApplication => vec![
            spec(CharacteristicRole::TextWrite, PEER_APP_UUID_FORMAT, 0x0002, true),
            spec(CharacteristicRole::TextNotify, PEER_APP_UUID_FORMAT, 0x0003, true),
            spec(CharacteristicRole::VoiceWrite, PEER_APP_UUID_FORMAT, 0x0002, false),
            spec(CharacteristicRole::VoiceNotify, PEER_APP_UUID_FORMAT, 0x0003, false),
        ],
    }
}

/// Resolved characteristics of the active link
#[derive(Debug, Clone, Default)]
pub struct CharacteristicRegistry {
    by_role: HashMap<CharacteristicRole, CharacteristicHandle>,
    /// Notification dispatch: characteristic UUID to the role its values feed
    notify_roles: HashMap<String, CharacteristicRole>,
}

impl CharacteristicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every role of the peer's table against the discovered set.
    ///
    /// Fails with [`LinkError::CapabilityMissing`] for the first mandatory role
    /// that has no matching characteristic.
    pub fn resolve(peer: PeerKind, discovered: &[CharacteristicHandle]) -> Result<Self> {
        let available: HashSet<&str> = discovered.iter().map(|h| h.uuid.as_str()).collect();
        let mut registry = Self::new();

        for spec in role_table(peer) {
            let uuid = spec.uuid.to_uppercase();
            if available.contains(uuid.as_str()) {
                debug!("Resolved {} -> {}", spec.role, uuid);
                if spec.role.is_notifying() {
                    registry.notify_roles.entry(uuid.clone()).or_insert(spec.role);
                }
                registry
                    .by_role
                    .insert(spec.role, CharacteristicHandle::new(uuid));
            } else if spec.mandatory {
                warn!("Mandatory characteristic for {} not found ({})", spec.role, uuid);
                return Err(LinkError::CapabilityMissing(spec.role));
            } else {
                debug!("Optional characteristic for {} not present", spec.role);
            }
        }

        info!(
            "Resolved {} roles for {} ({} notifying characteristics)",
            registry.by_role.len(),
            peer,
            registry.notify_roles.len()
        );
        Ok(registry)
    }

    /// Handle serving a role
    pub fn get(&self, role: CharacteristicRole) -> Result<&CharacteristicHandle> {
        self.by_role
            .get(&role)
            .ok_or(LinkError::CapabilityMissing(role))
    }

    pub fn contains(&self, role: CharacteristicRole) -> bool {
        self.by_role.contains_key(&role)
    }

    /// Role that notifications from a characteristic should be routed to
    pub fn notify_role(&self, uuid: &str) -> Option<CharacteristicRole> {
        self.notify_roles.get(&uuid.to_uppercase()).copied()
    }

    /// Characteristics that need a notification subscription, one per UUID.
    /// Route their values with [`notify_role`](Self::notify_role).
    pub fn subscriptions(&self) -> Vec<CharacteristicHandle> {
        let mut subs: Vec<_> = self
            .notify_roles
            .keys()
            .map(|uuid| CharacteristicHandle::new(uuid.clone()))
            .collect();
        subs.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        subs
    }

    pub fn len(&self) -> usize {
        self.by_role.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_role.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_role.clear();
        self.notify_roles.clear();
    }
}
