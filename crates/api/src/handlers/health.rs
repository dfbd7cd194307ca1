//! Health check handler

use axum::Json;

/// Liveness probe.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "novavid-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
