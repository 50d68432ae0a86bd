//! # speech-stream - Main Application Entry Point
//!
//! Starts the HTTP control API for the streaming core. The server itself never touches
//! audio: sessions run on their own tasks and the real-time paths run on device threads.
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + `APP_*` environment variables)
//! - **state**: shared state, request metrics and the current session slot
//! - **health**: health and metrics endpoints
//! - **middleware**: per-route request metrics
//! - **handlers**: config and session endpoints
//! - **session**: the stream session state machine behind the session endpoints

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use speech_stream::audio::CpalBackend;
use speech_stream::config::AppConfig;
use speech_stream::state::AppState;
use speech_stream::transport::WebSocketConnector;
use speech_stream::{handlers, health, middleware};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handlers; polled by [`wait_for_shutdown`].
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup order:
/// 1. `.env`, then logging
/// 2. Configuration (fails fast on invalid values)
/// 3. Shared state with the cpal backend and the WebSocket connector
/// 4. HTTP server, until a shutdown signal arrives
///
/// On shutdown the active session (if any) is ended before the server stops, so the
/// devices are released and the service sees `session_end`.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-stream v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        "Speech service: {} (playback {} Hz, capture {} Hz)",
        config.service.url, config.playback.sample_rate, config.capture.sample_rate
    );

    let app_state = AppState::new(
        config.clone(),
        Arc::new(CpalBackend::new()),
        Arc::new(WebSocketConnector),
    );
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::post().to(handlers::create_session))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session", web::delete().to(handlers::end_session))
                    .route(
                        "/session/recording/start",
                        web::post().to(handlers::start_recording),
                    )
                    .route(
                        "/session/recording/stop",
                        web::post().to(handlers::stop_recording),
                    )
                    .route("/session/barge-in", web::post().to(handlers::barge_in))
                    .route("/session/prebuffer", web::put().to(handlers::set_prebuffer)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            if let Some(session) = app_state.take_session() {
                info!(session_id = %session.id(), "Ending active session");
                session.end().await;
            }
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging, filtered by `RUST_LOG`.
///
/// Defaults to `speech_stream=debug,actix_web=info` when `RUST_LOG` is unset.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_stream=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise [`SHUTDOWN_SIGNAL`] on the first one.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
