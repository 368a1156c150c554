//! OpenAPI specification generation for the nearguard API.
//!
//! The document is served at `/api/openapi.json` and `/api-docs/openapi.json`
//! (backing Swagger UI), and written to disk by the `gen-openapi` binary.

use axum::Json;
use nearguard_core::{
    AlertLevel, BatteryReport, BatteryState, DeviceIdentity, OperatingMode, ProximityCategory,
    StatusSnapshot, TrackedDevice,
};
use utoipa::OpenApi;

use super::config::{
    AlertCycleResponse, BeaconSelectionResponse, CalibrationResponse, ConfigResponse,
};
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::tracker::{SendAlertRequest, SendAlertResponse};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty JSON.
/// Used by the gen-openapi binary.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> serde_json::Result<String> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for nearguard.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "nearguard API",
        version = "0.1.0",
        description = r#"
# nearguard API

nearguard keeps track of a Bluetooth LE beacon and tells you when it leaves range.

## Modes

1. **Idle**: nothing is tracked. `POST /api/radar` discovers a beacon.
2. **Radar**: the beacon's advertised signal strength is watched passively and
   converted into a distance estimate. Dropping below the range threshold starts
   a short, bounded series of local notifications.
3. **Alert**: the beacon is connected and alert levels (`off`, `mild`, `strong`)
   can be sent to its buzzer. Signal fields freeze at their last value.

`POST /api/disconnect` returns to Idle from any mode.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local nearguard server")
    ),
    tags(
        (
            name = "system",
            description = "Health checks"
        ),
        (
            name = "config",
            description = "Active tracker configuration"
        ),
        (
            name = "tracker",
            description = "Beacon tracking, operating modes and alert commands"
        )
    ),
    paths(
        // Health endpoints
        super::health::health_check,
        // Tracker endpoints
        super::tracker::get_status,
        super::tracker::request_radar,
        super::tracker::request_alert_mode,
        super::tracker::send_alert,
        super::tracker::disconnect,
        super::battery::get_battery,
        // Config endpoints
        super::config::get_config,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Tracker types
            StatusSnapshot,
            TrackedDevice,
            DeviceIdentity,
            OperatingMode,
            ProximityCategory,
            AlertLevel,
            SendAlertRequest,
            SendAlertResponse,
            // Battery types
            BatteryReport,
            BatteryState,
            // Config types
            ConfigResponse,
            CalibrationResponse,
            AlertCycleResponse,
            BeaconSelectionResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "nearguard API");
        assert!(spec.paths.paths.contains_key("/api/status"));
        assert!(spec.paths.paths.contains_key("/api/alert"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"nearguard API\""));
        assert!(json.contains("StatusSnapshot"));
    }
}
