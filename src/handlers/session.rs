//! Session control endpoints.
//!
//! Each handler copies the current [`SessionHandle`] out of the state and awaits the
//! session's reply; state-machine rejections come back as `409 Conflict`.

use crate::{
    error::AppError,
    session::SessionHandle,
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct PrebufferRequest {
    pub prebuffer_ms: u32,
}

fn require_session(state: &AppState) -> Result<SessionHandle, AppError> {
    state
        .current_session()
        .ok_or_else(|| AppError::NotFound("No active session".to_string()))
}

fn state_response(handle: &SessionHandle) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "session_id": handle.id(),
        "state": handle.state(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn create_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let handle = state.start_session().await?;
    info!(session_id = %handle.id(), "Session created via control API");

    Ok(HttpResponse::Created().json(json!({
        "session_id": handle.id(),
        "state": handle.state(),
        "created_at": handle.created_at().to_rfc3339()
    })))
}

pub async fn get_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let handle = require_session(&state)?;
    Ok(HttpResponse::Ok().json(handle.info().await))
}

pub async fn end_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let handle = state
        .take_session()
        .ok_or_else(|| AppError::NotFound("No active session".to_string()))?;
    handle.end().await;
    Ok(state_response(&handle))
}

pub async fn start_recording(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let handle = require_session(&state)?;
    handle.start_recording().await?;
    Ok(state_response(&handle))
}

pub async fn stop_recording(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let handle = require_session(&state)?;
    handle.stop_recording().await?;
    Ok(state_response(&handle))
}

pub async fn barge_in(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let handle = require_session(&state)?;
    handle.barge_in().await?;
    Ok(state_response(&handle))
}

pub async fn set_prebuffer(
    state: web::Data<AppState>,
    body: web::Json<PrebufferRequest>,
) -> Result<HttpResponse, AppError> {
    let handle = require_session(&state)?;
    let samples = handle.set_prebuffer_ms(body.prebuffer_ms).await?;

    Ok(HttpResponse::Ok().json(json!({
        "session_id": handle.id(),
        "prebuffer_ms": body.prebuffer_ms,
        "prebuffer_samples": samples
    })))
}
