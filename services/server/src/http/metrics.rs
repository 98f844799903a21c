use crate::state::AppState;
use axum::{Json, extract::State, response::IntoResponse};

pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
