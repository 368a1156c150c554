//! Application configuration management.
//!
//! Handles loading, saving, and validating nearguard configuration including:
//! - Signal calibration constants (reference power, path loss, range threshold)
//! - Out-of-range notification cycle timing
//! - Beacon selection and GATT identifiers
//! - HTTP server binding
//!
//! Sources are layered: built-in defaults, then an optional TOML file, then
//! environment variables of the form `NEARGUARD__SECTION__KEY`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "NEARGUARD";

/// Bluetooth SIG Immediate Alert service (0x1802).
pub const IMMEDIATE_ALERT_SERVICE_UUID: Uuid = bluetooth_base_uuid(0x1802);

/// Bluetooth SIG Alert Level characteristic (0x2A06).
pub const ALERT_LEVEL_CHARACTERISTIC_UUID: Uuid = bluetooth_base_uuid(0x2A06);

/// Bluetooth SIG Battery service (0x180F).
pub const BATTERY_SERVICE_UUID: Uuid = bluetooth_base_uuid(0x180F);

/// Bluetooth SIG Battery Level characteristic (0x2A19).
pub const BATTERY_LEVEL_CHARACTERISTIC_UUID: Uuid = bluetooth_base_uuid(0x2A19);

/// Vendor buzzer service exposed by the nearguard tag firmware.
pub const TAG_BUZZER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x1234_5678_abcd_efab_cdef_1234_5678_9abc);

/// Intermittent buzzer characteristic of the nearguard tag firmware.
pub const TAG_BUZZER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x1234_5679_abcd_efab_cdef_1234_5678_9abc);

/// Expand a 16-bit SIG-assigned number onto the Bluetooth base UUID.
const fn bluetooth_base_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC address pattern is valid")
});

/// Returns `true` for a colon-separated 48-bit Bluetooth address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A source could not be parsed or merged.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// A specialized [`Result`] type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signal calibration constants.
    pub calibration: CalibrationConfig,

    /// Out-of-range notification cycle.
    pub alert: AlertConfig,

    /// Beacon selection and GATT identifiers.
    pub bluetooth: BluetoothConfig,

    /// HTTP server settings.
    pub server: ServerConfig,
}

/// Calibration constants for [`SignalProcessor`](crate::signal::SignalProcessor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Expected RSSI at 1 m, in dBm.
    pub measured_power_at_1m: i16,

    /// Path loss exponent (2 = free space, 4 = cluttered indoor).
    pub environmental_factor: f64,

    /// Strongest RSSI still judged out of range, in dBm.
    pub out_of_range_threshold_dbm: i16,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            measured_power_at_1m: -52,
            environmental_factor: 4.0,
            out_of_range_threshold_dbm: -100,
        }
    }
}

/// Timing of the out-of-range notification cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Notifications per out-of-range episode.
    pub max_fires: u32,

    /// Spacing between notifications, in milliseconds.
    pub period_ms: u64,

    /// Automatic radar restarts after a failed alert connection.
    pub max_automatic_retries: u8,
}

impl AlertConfig {
    /// Spacing between notifications.
    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_fires: 5,
            period_ms: 1000,
            max_automatic_retries: 1,
        }
    }
}

/// Beacon selection and GATT layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Address to select directly instead of picking the first advertiser.
    pub device_address: Option<String>,

    /// Only consider advertisers whose name starts with this prefix.
    pub name_prefix: Option<String>,

    /// How long discovery waits for a matching advertiser.
    pub discovery_timeout_secs: u64,

    /// Service carrying the alert characteristic.
    pub alert_service_uuid: Uuid,

    /// Characteristic receiving the one-byte alert level.
    pub alert_characteristic_uuid: Uuid,

    /// Service carrying the battery level.
    pub battery_service_uuid: Uuid,

    /// Characteristic holding the battery percentage.
    pub battery_level_uuid: Uuid,
}

impl BluetoothConfig {
    /// Discovery timeout as a [`Duration`].
    #[must_use]
    pub const fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_address: None,
            name_prefix: None,
            discovery_timeout_secs: 10,
            alert_service_uuid: IMMEDIATE_ALERT_SERVICE_UUID,
            alert_characteristic_uuid: ALERT_LEVEL_CHARACTERISTIC_UUID,
            battery_service_uuid: BATTERY_SERVICE_UUID,
            battery_level_uuid: BATTERY_LEVEL_CHARACTERISTIC_UUID,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind_address: String,

    /// Use production logging (JSON files + compact stdout).
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            production: false,
        }
    }
}

impl Config {
    /// Load configuration from `path` (or the default location), applying
    /// environment overrides, then validate it.
    ///
    /// A missing file is not an error; defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let path = path.map_or_else(default_config_path, Path::to_path_buf);
        tracing::debug!(path = %path.display(), "Loading configuration");

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_path()).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        })
    }

    /// Check every field, collecting all violations.
    ///
    /// # Errors
    ///
    /// Returns the single violation, or `MultipleValidationErrors` if several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        let calibration = &self.calibration;
        if !(-127..=0).contains(&calibration.measured_power_at_1m) {
            errors.push(invalid(
                "calibration.measured_power_at_1m",
                format!("{} dBm is outside -127..=0", calibration.measured_power_at_1m),
            ));
        }
        if !(1.0..=6.0).contains(&calibration.environmental_factor) {
            errors.push(invalid(
                "calibration.environmental_factor",
                format!("{} is outside 1.0..=6.0", calibration.environmental_factor),
            ));
        }
        if !(-127..=0).contains(&calibration.out_of_range_threshold_dbm) {
            errors.push(invalid(
                "calibration.out_of_range_threshold_dbm",
                format!(
                    "{} dBm is outside -127..=0",
                    calibration.out_of_range_threshold_dbm
                ),
            ));
        }

        if self.alert.max_fires == 0 {
            errors.push(invalid("alert.max_fires", "must be at least 1".into()));
        }
        if self.alert.period_ms < 100 {
            errors.push(invalid(
                "alert.period_ms",
                format!("{} ms is shorter than 100 ms", self.alert.period_ms),
            ));
        }

        if let Some(address) = &self.bluetooth.device_address {
            if !is_valid_mac_address(address) {
                errors.push(invalid(
                    "bluetooth.device_address",
                    format!("'{address}' is not a valid Bluetooth address (XX:XX:XX:XX:XX:XX)"),
                ));
            }
        }
        if self.bluetooth.discovery_timeout_secs == 0 {
            errors.push(invalid(
                "bluetooth.discovery_timeout_secs",
                "must be at least 1".into(),
            ));
        }

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(invalid(
                "server.bind_address",
                format!("'{}' is not a socket address", self.server.bind_address),
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

fn invalid(field: &'static str, message: String) -> ConfigError {
    ConfigError::ValidationError { field, message }
}

/// Get the default configuration file path.
///
/// On Linux: `/etc/nearguard/config.toml`; elsewhere the platform config dir.
#[must_use]
pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/nearguard/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "nearguard").map_or_else(
            || PathBuf::from("nearguard.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.calibration.measured_power_at_1m, -52);
        assert_eq!(config.alert.max_fires, 5);
        assert_eq!(config.alert.period(), Duration::from_secs(1));
    }

    #[test]
    fn test_sig_uuids_expand_onto_base() {
        assert_eq!(
            IMMEDIATE_ALERT_SERVICE_UUID.to_string(),
            "00001802-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            ALERT_LEVEL_CHARACTERISTIC_UUID.to_string(),
            "00002a06-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            TAG_BUZZER_SERVICE_UUID.to_string(),
            "12345678-abcd-efab-cdef-123456789abc"
        );
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("D4:36:39:6F:AA:01"));
        assert!(is_valid_mac_address("d4:36:39:6f:aa:01"));
        assert!(!is_valid_mac_address("D4-36-39-6F-AA-01"));
        assert!(!is_valid_mac_address("D4:36:39:6F:AA"));
        assert!(!is_valid_mac_address(""));
    }

    #[test]
    fn test_validation_collects_every_violation() {
        let mut config = Config::default();
        config.alert.max_fires = 0;
        config.calibration.environmental_factor = 9.0;
        config.bluetooth.device_address = Some("nope".into());

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_violation_is_reported_directly() {
        let mut config = Config::default();
        config.server.bind_address = "localhost".into();

        match config.validate() {
            Err(ConfigError::ValidationError { field, .. }) => {
                assert_eq!(field, "server.bind_address");
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.calibration.out_of_range_threshold_dbm = -90;
        config.alert.period_ms = 500;
        config.bluetooth.name_prefix = Some("nearguard".into());
        config.bluetooth.alert_service_uuid = TAG_BUZZER_SERVICE_UUID;
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[alert]\nmax_fires = 3\n").unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.alert.max_fires, 3);
        assert_eq!(loaded.alert.period_ms, 1000);
        assert_eq!(loaded.calibration, CalibrationConfig::default());
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[alert]\nperiod_ms = 5\n").unwrap();

        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::ValidationError {
                field: "alert.period_ms",
                ..
            })
        ));
    }
}
