use axum::Json;

/// GET /health — transport-level liveness, no token required.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
