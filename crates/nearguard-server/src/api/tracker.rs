//! Tracker API endpoints.
//!
//! Exposes the tracker's published state and the user-initiated transitions:
//! start radar, arm alert mode, send an alert level, disconnect.

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use nearguard_core::{AlertLevel, OperatingMode, StatusSnapshot};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// How long `POST /api/disconnect` waits for the tracker to settle in Idle.
const DISCONNECT_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Creates the tracker router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/radar", post(request_radar))
        .route("/alert-mode", post(request_alert_mode))
        .route("/alert", post(send_alert))
        .route("/disconnect", post(disconnect))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Alert command request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "level": "strong" }))]
pub struct SendAlertRequest {
    /// Level to send to the beacon.
    pub level: AlertLevel,
}

/// Alert command response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "level": "strong",
    "buzzer_intensity": 100,
    "sent_at_utc": "2025-01-15T03:30:00Z"
}))]
pub struct SendAlertResponse {
    /// Level that was sent.
    pub level: AlertLevel,

    /// Buzzer duty cycle the beacon applies for this level (0-100).
    #[schema(example = 100, minimum = 0, maximum = 100)]
    pub buzzer_intensity: u8,

    /// When the command was written.
    #[schema(example = "2025-01-15T03:30:00Z")]
    pub sent_at_utc: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the tracker's current state.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "tracker",
    operation_id = "getStatus",
    summary = "Get tracker status",
    description = "Returns the current operating mode, the tracked beacon with its \
        last signal strength and distance estimate, and the out-of-range and \
        loading flags.",
    responses(
        (status = 200, description = "Current status", body = StatusSnapshot)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> Json<StatusSnapshot> {
    Json(state.controller().status())
}

/// Discover a beacon and start passive monitoring.
#[utoipa::path(
    post,
    path = "/api/radar",
    tag = "tracker",
    operation_id = "startRadar",
    summary = "Start radar mode",
    description = "Discovers a beacon and starts watching its signal strength. \
        Only accepted while idle.",
    responses(
        (status = 200, description = "Radar started, or selection cancelled", body = StatusSnapshot),
        (status = 404, description = "No beacon answered", body = ErrorResponse),
        (status = 409, description = "Not idle", body = ErrorResponse)
    )
)]
pub async fn request_radar(State(state): State<SharedState>) -> ApiResult<Json<StatusSnapshot>> {
    state.controller().request_radar().await?;
    Ok(Json(state.controller().status()))
}

/// Open the alert connection.
#[utoipa::path(
    post,
    path = "/api/alert-mode",
    tag = "tracker",
    operation_id = "startAlertMode",
    summary = "Arm alert mode",
    description = "Connects to the tracked beacon so alert levels can be sent. \
        Only accepted in radar mode. If the connection fails the tracker resumes \
        radar on its own.",
    responses(
        (status = 200, description = "Alert mode armed", body = StatusSnapshot),
        (status = 409, description = "Not in radar mode", body = ErrorResponse),
        (status = 503, description = "Connection failed", body = ErrorResponse)
    )
)]
pub async fn request_alert_mode(
    State(state): State<SharedState>,
) -> ApiResult<Json<StatusSnapshot>> {
    state.controller().request_alert_mode().await?;
    Ok(Json(state.controller().status()))
}

/// Send an alert level to the beacon.
#[utoipa::path(
    post,
    path = "/api/alert",
    tag = "tracker",
    operation_id = "sendAlert",
    summary = "Send alert level",
    description = "Writes an alert level (off, mild, strong) to the beacon. \
        Only accepted in alert mode. A failed write leaves the mode unchanged.",
    request_body = SendAlertRequest,
    responses(
        (status = 200, description = "Alert sent", body = SendAlertResponse),
        (status = 400, description = "Malformed body", body = ErrorResponse),
        (status = 422, description = "Unknown alert level", body = ErrorResponse),
        (status = 409, description = "Not in alert mode", body = ErrorResponse),
        (status = 502, description = "Write failed", body = ErrorResponse)
    )
)]
pub async fn send_alert(
    State(state): State<SharedState>,
    payload: Result<Json<SendAlertRequest>, JsonRejection>,
) -> ApiResult<Json<SendAlertResponse>> {
    let Json(request) = payload?;
    state.controller().send_alert(request.level).await?;
    Ok(Json(SendAlertResponse {
        level: request.level,
        buzzer_intensity: request.level.buzzer_intensity(),
        sent_at_utc: Utc::now().to_rfc3339(),
    }))
}

/// Tear the session down.
#[utoipa::path(
    post,
    path = "/api/disconnect",
    tag = "tracker",
    operation_id = "disconnect",
    summary = "Disconnect",
    description = "Stops monitoring, closes any alert connection and returns to idle. \
        Safe to call repeatedly.",
    responses(
        (status = 200, description = "Disconnected", body = StatusSnapshot)
    )
)]
pub async fn disconnect(State(state): State<SharedState>) -> ApiResult<Json<StatusSnapshot>> {
    let mut updates = state.controller().subscribe();
    state.controller().disconnect().await?;

    let settled = tokio::time::timeout(
        DISCONNECT_SETTLE_TIMEOUT,
        updates.wait_for(|s| s.mode == OperatingMode::Idle),
    )
    .await
    .is_ok_and(|idle| idle.is_ok());
    if !settled {
        debug!("Tracker did not report idle before the settle timeout");
    }
    Ok(Json(state.controller().status()))
}
