//! Health Check Endpoint

use axum::Json;
use serde_json::json;

/// GET /health
/// Basic health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "caravel-orchestrator",
    }))
}
