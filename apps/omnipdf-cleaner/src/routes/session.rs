//! Session Routes
//!
//! The session id travels in an HttpOnly cookie. Documents join a session
//! only through the upload path, never by client request.
//!
//! Endpoints:
//! - POST /session - Start a session, replacing any live one
//! - GET /session - Current session info
//! - DELETE /session - End the session and clear the cookie
//! - GET /session/documents - Documents of the session
//! - DELETE /session/documents/:doc_id - Remove a document
//! - GET /session/documents/:doc_id - Access check plus derived objects

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::session::SessionError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DocumentsResponse {
    pub documents: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub doc_id: String,
    pub blobs: Vec<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            post(create_session).get(get_session).delete(end_session),
        )
        .route("/documents", get(list_documents))
        .route(
            "/documents/:doc_id",
            get(get_document).delete(remove_document),
        )
}

/// Value of the named cookie, if the request carries it
fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn cookie_header(name: &str, value: &str, max_age_secs: u64) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{}={}; HttpOnly; Path=/; Max-Age={}",
        name, value, max_age_secs
    ))
    .map_err(|e| AppError::Internal(format!("Invalid cookie header: {}", e)))
}

/// Session id from the cookie, if the session is still live
async fn require_session(state: &AppState, headers: &HeaderMap) -> Result<String> {
    let session_id = read_cookie(headers, &state.config().session.cookie_name)
        .ok_or(SessionError::InvalidSession)?;
    if !state.sessions().validate(&session_id).await? {
        return Err(SessionError::InvalidSession.into());
    }
    Ok(session_id)
}

/// POST /session
async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let sessions = state.sessions();
    let cookie_name = &state.config().session.cookie_name;

    if let Some(previous) = read_cookie(&headers, cookie_name) {
        sessions.delete_session(&previous).await?;
    }

    let session_id = sessions.create_session().await?;
    let info = sessions
        .info(&session_id)
        .await?
        .ok_or_else(|| AppError::Internal("Session vanished after creation".to_string()))?;
    let max_age = sessions.ttl().map(|ttl| ttl.as_secs()).unwrap_or_default();
    let cookie = cookie_header(cookie_name, &session_id, max_age)?;

    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(SessionResponse {
            session_id,
            created_at: info.created_at,
        }),
    ))
}

/// GET /session
async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>> {
    let session_id = require_session(&state, &headers).await?;
    let info = state
        .sessions()
        .info(&session_id)
        .await?
        .ok_or(SessionError::InvalidSession)?;

    Ok(Json(SessionResponse {
        session_id,
        created_at: info.created_at,
    }))
}

/// DELETE /session
///
/// Always clears the cookie, even when the session had already ended.
async fn end_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let cookie_name = &state.config().session.cookie_name;
    if let Some(session_id) = read_cookie(&headers, cookie_name) {
        state.sessions().delete_session(&session_id).await?;
    }

    let cookie = cookie_header(cookie_name, "", 0)?;
    Ok((StatusCode::NO_CONTENT, [(header::SET_COOKIE, cookie)]))
}

/// GET /session/documents
async fn list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DocumentsResponse>> {
    let session_id = require_session(&state, &headers).await?;
    let documents = state.sessions().documents(&session_id).await?;
    Ok(Json(DocumentsResponse { documents }))
}

/// DELETE /session/documents/:doc_id
async fn remove_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let session_id = require_session(&state, &headers).await?;
    state.sessions().remove_document(&session_id, &doc_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /session/documents/:doc_id
///
/// Any failed check is the same 403, so callers cannot probe which
/// documents exist.
async fn get_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DocumentResponse>> {
    let cookie_name = &state.config().session.cookie_name;
    let session_id = read_cookie(&headers, cookie_name).ok_or(AppError::Forbidden)?;
    if !state.sessions().validate_pair(&session_id, &doc_id).await? {
        return Err(AppError::Forbidden);
    }

    let blobs = state.sessions().blobs(&doc_id).await?;
    Ok(Json(DocumentResponse { doc_id, blobs }))
}
