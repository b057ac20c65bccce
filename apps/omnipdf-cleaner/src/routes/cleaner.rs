//! Cleanup scheduling endpoints
//!
//! Endpoints:
//! - POST /cleaner/redis - Delete a keyed-store entry after `ttl` seconds
//! - POST /cleaner/s3 - Delete a document's derived objects after `ttl` seconds
//! - POST /cleaner/s3-file - Delete one object after `ttl` seconds
//! - POST /cleaner/chroma - Vector index cleanup after `ttl` seconds
//! - GET /cleaner/status - Watcher state, counters and recent jobs

use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::cleaner::{schedule_cleanup, WatcherStatus};
use crate::error::{AppError, Result};
use crate::keys::{Tag, TaggedKey};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub key: String,
    /// Seconds until cleanup
    pub ttl: u64,
}

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub key: String,
    pub ttl: u64,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/redis", post(schedule_store_entry))
        .route("/s3", post(schedule_blob_set))
        .route("/s3-file", post(schedule_blob_object))
        .route("/chroma", post(schedule_vector_index))
        .route("/status", get(status))
}

async fn schedule_store_entry(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduleResponse>)> {
    schedule(&state, Tag::RedisKey, request).await
}

async fn schedule_blob_set(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduleResponse>)> {
    schedule(&state, Tag::S3Key, request).await
}

async fn schedule_blob_object(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduleResponse>)> {
    schedule(&state, Tag::S3File, request).await
}

async fn schedule_vector_index(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduleResponse>)> {
    schedule(&state, Tag::ChromaDbKey, request).await
}

async fn schedule(
    state: &AppState,
    tag: Tag,
    request: ScheduleRequest,
) -> Result<(StatusCode, Json<ScheduleResponse>)> {
    if request.ttl == 0 {
        return Err(AppError::BadRequest("ttl must be at least one second".to_string()));
    }
    let key = TaggedKey::new(tag, request.key)?;

    schedule_cleanup(state.store(), &key, Duration::from_secs(request.ttl)).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ScheduleResponse {
            key: key.to_string(),
            ttl: request.ttl,
        }),
    ))
}

/// GET /cleaner/status
async fn status(State(state): State<AppState>) -> Json<WatcherStatus> {
    Json(state.watcher().status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::*;
    use crate::store::KeyedStore;
    use axum::{
        body::Body,
        http::{header, Request},
    };
    use tower::ServiceExt;

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_schedule_writes_flag() {
        let (state, store) = memory_state();
        let app = crate::routes::router(state);

        let response = app
            .oneshot(post_json(
                "/cleaner/s3-file",
                serde_json::json!({ "key": "doc1.pdf", "ttl": 60 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["key"], "S3_File:doc1.pdf");

        let ttl = store.ttl("S3_File:doc1.pdf").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_each_endpoint_uses_its_tag() {
        let (state, store) = memory_state();
        let app = crate::routes::router(state);

        for (uri, key) in [
            ("/cleaner/redis", "RedisKey:k"),
            ("/cleaner/s3", "S3Key:k"),
            ("/cleaner/chroma", "ChromaDBKey:k"),
        ] {
            let response = app
                .clone()
                .oneshot(post_json(uri, serde_json::json!({ "key": "k", "ttl": 5 })))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            assert!(store.exists(key).await.unwrap(), "missing {}", key);
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let (state, store) = memory_state();
        let app = crate::routes::router(state);

        for body in [
            serde_json::json!({ "key": "", "ttl": 5 }),
            serde_json::json!({ "key": "a:b", "ttl": 5 }),
            serde_json::json!({ "key": "doc", "ttl": 0 }),
        ] {
            let response = app
                .clone()
                .oneshot(post_json("/cleaner/s3", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_status() {
        let (state, _) = memory_state();
        let response = crate::routes::router(state)
            .oneshot(Request::get("/cleaner/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["state"], "stopped");
        assert_eq!(body["stats"]["dispatched"], 0);
        assert!(body["recent_jobs"].as_array().unwrap().is_empty());
    }
}
