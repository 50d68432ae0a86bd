use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Partial update, e.g. `{"playback": {"prebuffer_ms": 500}}`.
///
/// Takes effect for the next session; a running session keeps its settings.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    state.update_config(updated.clone())?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; applies to the next session",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_session": state.has_active_session(),
        "updated_config": updated
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::virtual_device::VirtualBackend;
    use crate::config::AppConfig;
    use crate::transport::memory::MemoryConnector;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn app_state() -> AppState {
        AppState::new(
            AppConfig::default(),
            Arc::new(VirtualBackend::new(24_000, 16_000)),
            Arc::new(MemoryConnector::default()),
        )
    }

    #[actix_web::test]
    async fn test_partial_config_update() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"playback": {"prebuffer_ms": 250}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().playback.prebuffer_ms, 250);
        assert_eq!(state.get_config().playback.quantum, 512);
    }

    #[actix_web::test]
    async fn test_invalid_config_update_is_rejected() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"capture": {"quantum": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().capture.quantum, 4096);
    }
}
