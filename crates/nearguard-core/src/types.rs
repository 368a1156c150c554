//! Shared types and OpenAPI schemas.
//!
//! This module contains the data model shared by the session, the alert cycle
//! and the mode controller, plus the snapshot published to observers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::signal::ProximityCategory;

/// Opaque, session-scoped identity of a discovered beacon.
///
/// For the BlueZ backend this is the device address; other transports may use
/// any stable token. Only the transport that produced it interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[schema(example = "D4:36:39:6F:AA:01")]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Wrap a transport-specific identity token.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The beacon currently being tracked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "identity": "D4:36:39:6F:AA:01",
    "display_name": "nearguard-tag",
    "last_rssi": -64,
    "last_distance_m": 1.88,
    "proximity": "near"
}))]
pub struct TrackedDevice {
    /// Session-scoped identity.
    pub identity: DeviceIdentity,

    /// Advertised name, when the beacon broadcasts one.
    pub display_name: Option<String>,

    /// Most recent signal strength in dBm.
    pub last_rssi: Option<i16>,

    /// Most recent distance estimate in meters.
    pub last_distance_m: Option<f64>,

    /// Most recent proximity category.
    pub proximity: Option<ProximityCategory>,
}

impl TrackedDevice {
    /// A freshly discovered device with no signal data yet.
    #[must_use]
    pub const fn new(identity: DeviceIdentity, display_name: Option<String>) -> Self {
        Self {
            identity,
            display_name,
            last_rssi: None,
            last_distance_m: None,
            proximity: None,
        }
    }

    /// Name to show to users, falling back to the identity.
    #[must_use]
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| self.identity.as_str())
    }
}

/// Operating mode of the controller. Exactly one is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// No device session.
    #[default]
    Idle,
    /// Passive monitoring of advertisement signal strength.
    Radar,
    /// Connected and armed to send alert commands.
    Alert,
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Radar => "radar",
            Self::Alert => "alert",
        };
        f.write_str(name)
    }
}

/// Alert command vocabulary understood by the beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Silence the beacon.
    Off,
    /// Gentle intermittent buzz.
    Mild,
    /// Full intensity intermittent buzz.
    Strong,
}

impl AlertLevel {
    /// Single-byte wire encoding written to the alert characteristic.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Off => 0x00,
            Self::Mild => 0x01,
            Self::Strong => 0x02,
        }
    }

    /// Decode a wire byte. Unknown values yield `None`.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Off),
            0x01 => Some(Self::Mild),
            0x02 => Some(Self::Strong),
            _ => None,
        }
    }

    /// Buzzer duty cycle (0-100) the beacon firmware applies for this level.
    #[must_use]
    pub const fn buzzer_intensity(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Mild => 50,
            Self::Strong => 100,
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Mild => "mild",
            Self::Strong => "strong",
        };
        f.write_str(name)
    }
}

/// One signal-strength observation delivered by a passive watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSample {
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// A flip of the range flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEdge {
    /// The beacon just left the configured range.
    OutOfRange,
    /// The beacon just came back.
    InRange,
}

/// Everything an observer needs to render the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatusSnapshot {
    /// Current operating mode.
    pub mode: OperatingMode,

    /// Tracked device, if any.
    pub device: Option<TrackedDevice>,

    /// Human-readable description of the last transition or failure.
    #[schema(example = "Radar: monitoring nearguard-tag")]
    pub status: String,

    /// Whether `status` describes a failure.
    pub is_error: bool,

    /// Whether the beacon is currently judged out of range.
    pub out_of_range: bool,

    /// Whether a connection attempt is in flight.
    pub loading: bool,

    /// Whether the out-of-range notification cycle is running.
    pub alert_cycle_active: bool,

    /// When this snapshot was produced.
    pub updated_at_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_level_wire_bytes() {
        assert_eq!(AlertLevel::Off.as_byte(), 0x00);
        assert_eq!(AlertLevel::Mild.as_byte(), 0x01);
        assert_eq!(AlertLevel::Strong.as_byte(), 0x02);
        assert_eq!(AlertLevel::from_byte(0x02), Some(AlertLevel::Strong));
        assert_eq!(AlertLevel::from_byte(0x03), None);
    }

    #[test]
    fn test_alert_level_buzzer_intensity() {
        assert_eq!(AlertLevel::Off.buzzer_intensity(), 0);
        assert_eq!(AlertLevel::Mild.buzzer_intensity(), 50);
        assert_eq!(AlertLevel::Strong.buzzer_intensity(), 100);
    }

    #[test]
    fn test_mode_serializes_lowercase() {
        let json = serde_json::to_string(&OperatingMode::Radar).unwrap();
        assert_eq!(json, "\"radar\"");
        assert_eq!(OperatingMode::default(), OperatingMode::Idle);
    }

    #[test]
    fn test_device_label_falls_back_to_identity() {
        let unnamed = TrackedDevice::new(DeviceIdentity::new("AA:BB"), None);
        assert_eq!(unnamed.label(), "AA:BB");

        let named = TrackedDevice::new(DeviceIdentity::new("AA:BB"), Some("tag".into()));
        assert_eq!(named.label(), "tag");
    }
}
