//! Configuration API endpoint.
//!
//! Read-only view of the settings the tracker was started with. Changing them
//! means editing the configuration file and restarting the server.

use axum::extract::State;
use axum::Json;
use nearguard_core::Config;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

// ============================================================================
// Response Types
// ============================================================================

/// Active tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "calibration": {
        "measured_power_at_1m": -52,
        "environmental_factor": 4.0,
        "out_of_range_threshold_dbm": -100
    },
    "alert_cycle": {
        "max_fires": 5,
        "period_ms": 1000,
        "max_automatic_retries": 1
    },
    "beacon": {
        "device_address": null,
        "name_prefix": "nearguard",
        "discovery_timeout_secs": 10
    }
}))]
pub struct ConfigResponse {
    /// Distance model constants.
    pub calibration: CalibrationResponse,

    /// Out-of-range notification cycle.
    pub alert_cycle: AlertCycleResponse,

    /// Beacon selection.
    pub beacon: BeaconSelectionResponse,
}

/// Distance model constants.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CalibrationResponse {
    /// Expected RSSI at 1 m, in dBm.
    #[schema(example = -52)]
    pub measured_power_at_1m: i16,

    /// Path loss exponent.
    #[schema(example = 4.0)]
    pub environmental_factor: f64,

    /// Strongest RSSI still judged out of range, in dBm.
    #[schema(example = -100)]
    pub out_of_range_threshold_dbm: i16,
}

/// Out-of-range notification cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AlertCycleResponse {
    /// Notifications per out-of-range episode.
    #[schema(example = 5)]
    pub max_fires: u32,

    /// Spacing between notifications, in milliseconds.
    #[schema(example = 1000)]
    pub period_ms: u64,

    /// Automatic radar restarts after a failed alert connection.
    #[schema(example = 1)]
    pub max_automatic_retries: u8,
}

/// How discovery picks a beacon.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BeaconSelectionResponse {
    /// Fixed address, if one is configured.
    #[schema(example = "D4:36:39:6F:AA:01", nullable)]
    pub device_address: Option<String>,

    /// Advertised name prefix filter.
    #[schema(example = "nearguard", nullable)]
    pub name_prefix: Option<String>,

    /// Seconds discovery waits for a matching advertiser.
    #[schema(example = 10)]
    pub discovery_timeout_secs: u64,
}

impl From<&Config> for ConfigResponse {
    fn from(config: &Config) -> Self {
        Self {
            calibration: CalibrationResponse {
                measured_power_at_1m: config.calibration.measured_power_at_1m,
                environmental_factor: config.calibration.environmental_factor,
                out_of_range_threshold_dbm: config.calibration.out_of_range_threshold_dbm,
            },
            alert_cycle: AlertCycleResponse {
                max_fires: config.alert.max_fires,
                period_ms: config.alert.period_ms,
                max_automatic_retries: config.alert.max_automatic_retries,
            },
            beacon: BeaconSelectionResponse {
                device_address: config.bluetooth.device_address.clone(),
                name_prefix: config.bluetooth.name_prefix.clone(),
                discovery_timeout_secs: config.bluetooth.discovery_timeout_secs,
            },
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the active configuration.
#[utoipa::path(
    get,
    path = "/api/config",
    tag = "config",
    operation_id = "getConfig",
    summary = "Get tracker configuration",
    description = "Returns the calibration constants, alert cycle timing and beacon \
        selection the tracker is running with.",
    responses(
        (status = 200, description = "Active configuration", body = ConfigResponse)
    )
)]
pub async fn get_config(State(state): State<SharedState>) -> Json<ConfigResponse> {
    Json(ConfigResponse::from(state.config()))
}
