//! # nearguard-core
//!
//! Core logic for the nearguard BLE beacon proximity tracker.
//!
//! This crate provides:
//! - RSSI to distance estimation and out-of-range detection
//! - Ownership of the single beacon session (passive watch or alert connection)
//! - A bounded, self-terminating out-of-range notification cycle
//! - The Idle / Radar / Alert operating mode state machine and its event loop
//! - Configuration management and the beacon battery model
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`signal`] - Distance estimation, proximity categories, range threshold
//! - [`transport`] - Contract with the wireless stack and the alert command sink
//! - [`session`] - Device session lifecycle and transport error classification
//! - [`alert_cycle`] - Out-of-range notification cycle
//! - [`controller`] - Operating mode state machine
//! - [`runtime`] - Single-task event loop and its command handle
//! - [`battery`] - Voltage interpolation and battery classification
//! - [`config`] - Application configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas
//! - `bluez` - BlueZ transport (feature `bluetooth`)
//! - [`mock`] - Scripted in-memory transport

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod alert_cycle;
pub mod battery;
#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod config;
pub mod controller;
pub mod error;
pub mod mock;
pub mod runtime;
pub mod session;
pub mod signal;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
pub use alert_cycle::{AlertCycleManager, AlertCycleState, LogNotifier, Notifier};
pub use battery::{voltage_to_percentage, BatteryReport, BatteryState};
#[cfg(feature = "bluetooth")]
pub use bluez::BluezTransport;
pub use config::{
    is_valid_mac_address, AlertConfig, BluetoothConfig, CalibrationConfig, Config, ConfigError,
    ConfigResult, ServerConfig,
};
pub use controller::{ModeController, RetryBudget};
pub use error::{NearGuardError, Result};
pub use mock::MockTransport;
pub use runtime::{spawn, ControllerHandle};
pub use session::{CancelToken, DeviceSession, SessionEvent};
pub use signal::{ProximityCategory, SignalProcessor};
pub use transport::{AlertTransport, Transport, TransportError};
pub use types::{
    AlertLevel, DeviceIdentity, OperatingMode, RangeEdge, RawSample, StatusSnapshot,
    TrackedDevice,
};
