//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `tracker` - Tracker status and mode transitions
//! - `battery` - Beacon battery level
//! - `config` - Active configuration (read-only)
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod battery;
pub mod config;
pub mod error;
pub mod health;
pub mod openapi;
pub mod tracker;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};

// Re-export OpenAPI utilities for the gen-openapi binary
pub use openapi::{get_openapi_json, ApiDoc};

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                  - Health check
/// /api
/// ├── /status              - Tracker status snapshot
/// ├── /radar               - Start radar mode
/// ├── /alert-mode          - Arm alert mode
/// ├── /alert               - Send an alert level
/// ├── /battery             - Beacon battery level
/// ├── /config              - Active configuration
/// ├── /disconnect          - Tear the session down
/// └── /openapi.json        - OpenAPI specification
/// /swagger-ui              - Swagger UI (spec at /api-docs/openapi.json)
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            tracker::router()
                .route("/battery", get(battery::get_battery))
                .route("/config", get(config::get_config))
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}
