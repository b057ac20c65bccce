//! Route modules for the OmniPDF cleaner

pub mod cleaner;
pub mod health;
pub mod session;

use axum::{http::Uri, Router};

use crate::error::AppError;
use crate::state::AppState;

/// Build the HTTP surface without middleware layers
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/cleaner", cleaner::router())
        .nest("/session", session::router())
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_reports_watcher_state() {
        let (state, _) = memory_state();
        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["watcher"], "stopped");
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (state, _) = memory_state();
        let response = router(state)
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");
    }
}
