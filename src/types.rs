//! Common types, enums, and error definitions for the companion link protocol

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Error types for link communication
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("missing capability: {0}")]
    CapabilityMissing(CharacteristicRole),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Not connected")]
    NotConnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<bluer::Error> for LinkError {
    fn from(e: bluer::Error) -> Self {
        LinkError::Transport(e.to_string())
    }
}

/// Sensor channels published by the companion module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryKind {
    /// Single signed 32-bit reading
    Accelerometer,
    Gyroscope,
    /// 3-axis accelerometer sharing the gyro/magnetometer layout
    MotionAccelerometer,
    Magnetometer,
    AirPressure,
    Temperature,
    Humidity,
    AirQuality,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 8] = [
        TelemetryKind::Accelerometer,
        TelemetryKind::Gyroscope,
        TelemetryKind::MotionAccelerometer,
        TelemetryKind::Magnetometer,
        TelemetryKind::AirPressure,
        TelemetryKind::Temperature,
        TelemetryKind::Humidity,
        TelemetryKind::AirQuality,
    ];

    /// Engineering unit reported with decoded samples
    pub fn unit(self) -> &'static str {
        match self {
            TelemetryKind::Accelerometer
            | TelemetryKind::Gyroscope
            | TelemetryKind::MotionAccelerometer
            | TelemetryKind::Magnetometer => "raw",
            TelemetryKind::AirPressure => "hPa",
            TelemetryKind::Temperature => "°C",
            TelemetryKind::Humidity => "%",
            TelemetryKind::AirQuality => "category",
        }
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryKind::Accelerometer => write!(f, "accelerometer"),
            TelemetryKind::Gyroscope => write!(f, "gyroscope"),
            TelemetryKind::MotionAccelerometer => write!(f, "motion-accelerometer"),
            TelemetryKind::Magnetometer => write!(f, "magnetometer"),
            TelemetryKind::AirPressure => write!(f, "air-pressure"),
            TelemetryKind::Temperature => write!(f, "temperature"),
            TelemetryKind::Humidity => write!(f, "humidity"),
            TelemetryKind::AirQuality => write!(f, "air-quality"),
        }
    }
}

/// Logical purpose of a remote characteristic on the active link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    TextWrite,
    TextNotify,
    VoiceWrite,
    VoiceNotify,
    ScanControl,
    ScanList,
    Telemetry(TelemetryKind),
}

impl CharacteristicRole {
    /// Whether the role delivers data through change notifications
    pub fn is_notifying(self) -> bool {
        matches!(
            self,
            CharacteristicRole::TextNotify
                | CharacteristicRole::VoiceNotify
                | CharacteristicRole::ScanControl
                | CharacteristicRole::ScanList
                | CharacteristicRole::Telemetry(_)
        )
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharacteristicRole::TextWrite => write!(f, "text-write"),
            CharacteristicRole::TextNotify => write!(f, "text-notify"),
            CharacteristicRole::VoiceWrite => write!(f, "voice-write"),
            CharacteristicRole::VoiceNotify => write!(f, "voice-notify"),
            CharacteristicRole::ScanControl => write!(f, "scan-state"),
            CharacteristicRole::ScanList => write!(f, "scan-list"),
            CharacteristicRole::Telemetry(kind) => write!(f, "telemetry-{}", kind),
        }
    }
}

/// Type tag carried in the first byte of every typed-prefix chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    Text = 0x00,
    VoiceStart = 0x01,
    VoiceData = 0x02,
    VoiceEnd = 0x03,
}

impl FrameTag {
    /// Convert a byte to a FrameTag
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(FrameTag::Text),
            0x01 => Ok(FrameTag::VoiceStart),
            0x02 => Ok(FrameTag::VoiceData),
            0x03 => Ok(FrameTag::VoiceEnd),
            _ => Err(LinkError::Protocol(format!(
                "unknown frame tag 0x{:02X}",
                value
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Framing style used for message payloads on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingStyle {
    /// Raw chunks closed by a zero-length chunk
    Terminator,
    /// Every chunk starts with a [`FrameTag`]
    TypedPrefix,
}

/// What kind of device sits on the other end of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    CompanionModule,
    PeerApplication,
}

impl PeerKind {
    pub fn framing(self) -> FramingStyle {
        match self {
            PeerKind::CompanionModule => FramingStyle::Terminator,
            PeerKind::PeerApplication => FramingStyle::TypedPrefix,
        }
    }
}

impl FromStr for PeerKind {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "module" | "companion" | "companion-module" => Ok(PeerKind::CompanionModule),
            "app" | "peer" | "peer-application" => Ok(PeerKind::PeerApplication),
            other => Err(LinkError::Config(format!("unknown peer kind '{}'", other))),
        }
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKind::CompanionModule => write!(f, "CompanionModule"),
            PeerKind::PeerApplication => write!(f, "PeerApplication"),
        }
    }
}

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Acceptor,
}

/// Where a connection attempt is aimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// Connect out to a known address; this side becomes the initiator
    Device(String),
    /// Wait for a peer to connect in; this side becomes the acceptor
    Incoming,
}

impl ConnectTarget {
    pub fn role(&self) -> LinkRole {
        match self {
            ConnectTarget::Device(_) => LinkRole::Initiator,
            ConnectTarget::Incoming => LinkRole::Acceptor,
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectTarget::Device(address) => write!(f, "{}", address),
            ConnectTarget::Incoming => write!(f, "<incoming>"),
        }
    }
}

/// Lifecycle state of the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Error(reason) => write!(f, "Error({})", reason),
        }
    }
}

/// One selectable device reported by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}
