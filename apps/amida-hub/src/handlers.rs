use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::hub::HubState;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Snapshot of the authoritative state, for the polling fallback clients use
/// when their push channel is down.
pub async fn get_state(State(hub): State<HubState>) -> impl IntoResponse {
    Json(hub.snapshot().await)
}
