use crate::http_server::MonoProxyRestState;
use axum::extract::State;
use axum::Json;

/// §6's observability document: routing counters as plain JSON, sourced
/// straight from the router's own `RouterMetrics`, distinct from the
/// Prometheus text exposition served at `/metrics`.
pub async fn router_stats(State(state): State<MonoProxyRestState>) -> Json<serde_json::Value> {
    Json(state.metrics.to_json())
}
