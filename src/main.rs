//! # Call Stream Backend
//!
//! Real-time coordinator for AI-assisted support calls. Participants join a
//! call session over WebSocket; the server relays their media and chat to
//! the session's other participants, feeds the streams through pluggable AI
//! pipelines, and fans generated replies back out to everyone on the call.
//!
//! Architecture:
//! - **ws**: WebSocket multiplexer (one actor per connection) and the
//!   connection registry used for all fan-out
//! - **stream**: audio and video stream processors with their periodic
//!   flush loops
//! - **session**: call session registry and status state machine
//! - **store**: append-only persistence seam
//! - **pipeline**: AI collaborator traits (speech, synthesis, vision)
//! - **handlers/health**: REST surface for sessions, fallback ingestion,
//!   config, and metrics

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod session;
mod state;
mod store;
mod stream;
mod ws;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global flag flipped by the signal handlers to request shutdown.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-stream-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // The flush loops run for the life of the process; the stream processors
    // are no-ops between calls.
    let audio_loop = app_state.audio.clone().spawn_flush_loop();
    let video_loop = app_state.video.clone().spawn_flush_loop();

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
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::metrics::MetricsMiddleware)
            .route("/ws/call", web::get().to(ws::call_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::config::get_config))
                    .route("/config", web::put().to(handlers::config::update_config))
                    .route("/sessions", web::post().to(handlers::sessions::create_session))
                    .route(
                        "/sessions/{session_id}",
                        web::get().to(handlers::sessions::get_session),
                    )
                    .route(
                        "/sessions/{session_id}/connections",
                        web::get().to(handlers::sessions::session_connections),
                    )
                    .route("/streams/audio", web::post().to(handlers::streams::submit_audio))
                    .route("/streams/video", web::post().to(handlers::streams::submit_video)),
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
            server_handle.stop(true).await;
        }
    }

    audio_loop.abort();
    video_loop.abort();

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_stream_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

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
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
