//! Telemetry packet decoding
//!
//! The companion firmware publishes each sensor on its own characteristic using a
//! fixed binary layout. Decoding is stateless: one raw notification maps to at
//! most one [`TelemetrySample`]. Layouts are a fixed contract with the firmware,
//! including the reversed byte order of the pressure reading.

use crate::types::TelemetryKind;
use log::debug;
use std::fmt;

/// Scale of the pressure sensor's 24-bit reading
const PRESSURE_SCALE: f64 = 4098.0;

/// Full-scale value of the 14-bit humidity/temperature sensor
const HT_FULL_SCALE: f64 = 16383.0;

/// Air quality buckets reported by the gas sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirQuality {
    Excellent,
    Good,
    Moderate,
    Poor,
    VeryPoor,
}

impl AirQuality {
    pub fn from_index(index: u8) -> Self {
        match index {
            0..=49 => AirQuality::Excellent,
            50..=99 => AirQuality::Good,
            100..=149 => AirQuality::Moderate,
            150..=199 => AirQuality::Poor,
            _ => AirQuality::VeryPoor,
        }
    }
}

impl fmt::Display for AirQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AirQuality::Excellent => write!(f, "Excellent"),
            AirQuality::Good => write!(f, "Good"),
            AirQuality::Moderate => write!(f, "Moderate"),
            AirQuality::Poor => write!(f, "Poor"),
            AirQuality::VeryPoor => write!(f, "Very Poor"),
        }
    }
}

/// Decoded reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryValue {
    Raw(i32),
    Axes { x: i16, y: i16, z: i16 },
    Scalar(f64),
    AirQuality { index: u8, level: AirQuality },
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Raw(v) => write!(f, "{}", v),
            TelemetryValue::Axes { x, y, z } => write!(f, "x={} y={} z={}", x, y, z),
            TelemetryValue::Scalar(v) => write!(f, "{:.2}", v),
            TelemetryValue::AirQuality { index, level } => write!(f, "{} ({})", level, index),
        }
    }
}

/// One decoded telemetry packet
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub kind: TelemetryKind,
    pub value: TelemetryValue,
    pub unit: &'static str,
    pub address: String,
}

impl fmt::Display for TelemetrySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} [{}]", self.kind, self.value, self.unit, self.address)
    }
}

/// Number of bytes each layout needs
pub fn expected_len(kind: TelemetryKind) -> usize {
    match kind {
        TelemetryKind::Accelerometer => 4,
        TelemetryKind::Gyroscope | TelemetryKind::MotionAccelerometer | TelemetryKind::Magnetometer => 6,
        TelemetryKind::AirPressure => 3,
        TelemetryKind::Temperature | TelemetryKind::Humidity => 2,
        TelemetryKind::AirQuality => 1,
    }
}

/// Decode a raw notification into a sample.
///
/// Returns `None` when the packet is shorter than the layout requires. Trailing
/// bytes beyond the layout are ignored.
pub fn decode(kind: TelemetryKind, raw: &[u8], address: &str) -> Option<TelemetrySample> {
    let needed = expected_len(kind);
    if raw.len() < needed {
        debug!(
            "Dropping {} packet: {} bytes, need {}",
            kind,
            raw.len(),
            needed
        );
        return None;
    }

    let value = match kind {
        TelemetryKind::Accelerometer => {
            TelemetryValue::Raw(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }
        TelemetryKind::Gyroscope | TelemetryKind::MotionAccelerometer | TelemetryKind::Magnetometer => {
            TelemetryValue::Axes {
                x: i16::from_le_bytes([raw[0], raw[1]]),
                y: i16::from_le_bytes([raw[2], raw[3]]),
                z: i16::from_le_bytes([raw[4], raw[5]]),
            }
        }
        TelemetryKind::AirPressure => {
            // Little-endian on the wire: the last byte is the most significant one
            let raw_pressure = ((raw[2] as u32) << 16) | ((raw[1] as u32) << 8) | raw[0] as u32;
            TelemetryValue::Scalar(raw_pressure as f64 / PRESSURE_SCALE)
        }
        TelemetryKind::Temperature => {
            let counts = u16::from_be_bytes([raw[0], raw[1]]) as f64;
            TelemetryValue::Scalar((counts / HT_FULL_SCALE) * 165.0 - 40.0)
        }
        TelemetryKind::Humidity => {
            let counts = u16::from_be_bytes([raw[0], raw[1]]) as f64;
            TelemetryValue::Scalar((counts / HT_FULL_SCALE) * 100.0)
        }
        TelemetryKind::AirQuality => TelemetryValue::AirQuality {
            index: raw[0],
            level: AirQuality::from_index(raw[0]),
        },
    };

    Some(TelemetrySample {
        kind,
        value,
        unit: kind.unit(),
        address: address.to_string(),
    })
}
