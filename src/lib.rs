//! BLE link and messaging protocol engine
//!
//! This library drives a single Bluetooth Low Energy link to either a companion
//! sensor module or a peer application, and exchanges text messages, voice blobs,
//! telemetry and device scan results over it.
//!
//! # Modules
//!
//! - `connection`: link lifecycle with bounded retries, and the `LinkTransport` platform trait
//! - `registry`: role tables per peer kind and the resolved characteristic registry
//! - `framing`: chunking and reassembly for terminator and typed-prefix framing
//! - `telemetry`: stateless decoding of the companion's sensor packets
//! - `scan_list`: parser for the companion's streamed device roster
//! - `engine`: message-level API and the `LinkEvent` stream
//! - `health`: traffic and reconnect bookkeeping
//! - `bluer_support`: `LinkTransport` on BlueZ
//! - `types`: common types and enums used throughout the library

pub mod bluer_support;
pub mod config;
pub mod connection;
pub mod engine;
pub mod framing;
pub mod health;
pub mod registry;
pub mod scan_list;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod mock_transport;

pub use bluer_support::BlueRSupport;
pub use config::LinkConfig;
pub use connection::{ConnectionManager, Link, LinkNotice, LinkTransport, NotificationStream};
pub use engine::{LinkEvent, ProtocolEngine};
pub use framing::{ChunkSink, Inbound, PayloadKind, Reassembler};
pub use health::{HealthMetrics, HealthStatus, LinkHealth, ReconnectReason};
pub use registry::{role_table, CharacteristicHandle, CharacteristicRegistry, RoleSpec};
pub use scan_list::{RosterUpdate, ScanListParser, ScanRoster};
pub use telemetry::{AirQuality, TelemetrySample, TelemetryValue};
pub use types::{
    CharacteristicRole, ConnectTarget, ConnectionState, DeviceRecord, FrameTag, FramingStyle,
    LinkError, LinkRole, PeerKind, Result, TelemetryKind,
};
