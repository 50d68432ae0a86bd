//! Health and metrics endpoints.
//!
//! `health_check` is cheap and never waits on the session task; it reads the session's
//! state from its watch channel. `detailed_metrics` asks the session for a full snapshot
//! (buffer fill, stream counters) and so may wait one loop iteration.

use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

/// Resident and virtual memory of this process, from `/proc/self/status`.
#[derive(Debug, Default, Serialize)]
struct MemoryUsage {
    available: bool,
    resident_bytes: u64,
    virtual_bytes: u64,
}

impl MemoryUsage {
    fn read() -> Self {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return Self::default();
        };
        let kilobytes = |field: &str| {
            status
                .lines()
                .find_map(|line| line.strip_prefix(field))
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|kb| kb.parse::<u64>().ok())
                .unwrap_or(0)
        };

        Self {
            available: true,
            resident_bytes: kilobytes("VmRSS:") * 1024,
            virtual_bytes: kilobytes("VmSize:") * 1024,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn request_totals(metrics: &AppMetrics) -> serde_json::Value {
    json!({
        "total_requests": metrics.request_count,
        "total_errors": metrics.error_count,
        "error_rate": ratio(metrics.error_count, metrics.request_count),
        "sessions_started": metrics.sessions_started
    })
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let session = state.current_session().map(|handle| {
        json!({
            "session_id": handle.id(),
            "state": handle.state(),
            "created_at": handle.created_at().to_rfc3339()
        })
    });

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.get_uptime_seconds(),
        "speech_service": config.service.url,
        "audio": {
            "backend": state.backend.name(),
            "playback": config.playback.spec(),
            "capture": config.capture.spec()
        },
        "session": session,
        "requests": request_totals(&state.get_metrics_snapshot()),
        "memory": MemoryUsage::read()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoints: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms()
            })
        })
        .collect();
    endpoints.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let stream = match state.current_session() {
        Some(handle) => Some(handle.info().await),
        None => None,
    };

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "requests": request_totals(&metrics),
        "requests_per_second": ratio(metrics.request_count, uptime_seconds),
        "endpoints": endpoints,
        "stream": stream,
        "memory": MemoryUsage::read()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::virtual_device::VirtualBackend;
    use crate::config::AppConfig;
    use crate::transport::memory::MemoryConnector;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_health_reports_audio_and_session() {
        let (connector, _peer) = MemoryConnector::with_peer(8);
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(VirtualBackend::new(24_000, 16_000)),
            Arc::new(connector),
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/health", web::get().to(health_check))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["audio"]["backend"], "virtual");
        assert_eq!(body["audio"]["playback"]["sample_rate"], 24_000);
        assert!(body["session"].is_null());

        let handle = state.start_session().await.unwrap();
        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        assert_eq!(body["stream"]["id"], handle.id());
        assert_eq!(body["stream"]["state"], "connecting");
        assert_eq!(body["requests"]["sessions_started"], 1);

        handle.end().await;
    }
}
