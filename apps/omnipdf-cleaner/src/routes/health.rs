//! Health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::cleaner::WatcherState;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub watcher: WatcherState,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let watcher = state.watcher().state();
    Json(HealthResponse {
        status: if watcher == WatcherState::Listening {
            "healthy"
        } else {
            "degraded"
        },
        version: env!("CARGO_PKG_VERSION"),
        service: "omnipdf-cleaner",
        watcher,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}
