pub mod auth;
pub mod collab;
pub mod http;
pub mod metrics;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::{Router, routing::get};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_client_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/v1/metrics", get(http::metrics::get_metrics))
        .route("/api/v1/fleet", get(http::fleet::get_fleet))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
