//! Health and metrics endpoints.

use crate::error::AppResult;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /health`: liveness probe with coarse runtime counters.
pub async fn health_check(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let metrics = state.metrics.read().unwrap().clone();
    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "uptime_seconds": state.uptime_seconds(),
        "active_connections": metrics.active_connections,
        "live_sessions": state.sessions.live_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// `GET /api/v1/metrics`: full operational snapshot.
pub async fn detailed_metrics(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let metrics = state.metrics.read().unwrap().clone();
    let streaming = state.config.read().unwrap().streaming.clone();

    Ok(HttpResponse::Ok().json(json!({
        "uptime_seconds": state.uptime_seconds(),
        "requests": {
            "total": metrics.request_count,
            "errors": metrics.error_count,
            "endpoints": metrics.endpoint_metrics,
        },
        "sessions": {
            "total": state.sessions.len(),
            "live": state.sessions.live_count(),
        },
        "connections": {
            "active": metrics.active_connections,
            "registered": state.connections.total_connections(),
        },
        "streams": {
            "media_units_ingested": metrics.media_units_ingested,
            "audio_sessions": state.audio.state_count(),
            "video_sessions": state.video.state_count(),
        },
        "store": {
            "media_records": state.store.media_count(),
            "transcript_records": state.store.transcript_count(),
        },
        "streaming_config": streaming,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_rt::test]
    async fn health_reports_live_sessions() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        state
            .sessions
            .create(Some("s1".into()), crate::session::CallType::Voice, None)
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["live_sessions"], 1);
    }

    #[actix_rt::test]
    async fn metrics_exposes_store_and_stream_counts() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["store"]["media_records"], 0);
        assert_eq!(body["streaming_config"]["audio_flush_ms"], 100);
    }
}
