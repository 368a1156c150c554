//! Battery API endpoint.

use axum::extract::State;
use axum::Json;
use nearguard_core::BatteryReport;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Read the beacon's battery level.
///
/// Requires alert mode, since the level is read over the alert connection.
#[utoipa::path(
    get,
    path = "/api/battery",
    tag = "tracker",
    operation_id = "getBattery",
    summary = "Read beacon battery",
    description = "Reads the Battery Level characteristic of the connected beacon and \
        classifies it (critical, low, medium, good). Only accepted in alert mode.",
    responses(
        (status = 200, description = "Battery level read", body = BatteryReport),
        (status = 409, description = "Not in alert mode", body = ErrorResponse),
        (status = 502, description = "Read failed", body = ErrorResponse)
    )
)]
pub async fn get_battery(State(state): State<SharedState>) -> ApiResult<Json<BatteryReport>> {
    let report = state.controller().read_battery().await?;
    Ok(Json(report))
}
