use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

/// Cluster view: healthy instances plus the routing pick.
pub async fn get_fleet(State(state): State<AppState>) -> impl IntoResponse {
    let fleet = &state.core.fleet;
    let healthy = match fleet.healthy_instances().await {
        Ok(instances) => instances,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "code": "STORE_UNAVAILABLE",
                    "message": e.to_string(),
                })),
            )
                .into_response();
        }
    };
    let least_loaded = fleet
        .least_loaded()
        .await
        .ok()
        .flatten()
        .map(|r| r.instance_id);
    Json(serde_json::json!({
        "instance_id": fleet.instance_id(),
        "healthy": healthy,
        "least_loaded": least_loaded,
    }))
    .into_response()
}
