//! Request/response fallback for media ingestion.
//!
//! Carries the same payload shape as the WebSocket media frames for clients
//! that cannot hold a socket open. Each POST ingests one unit and runs one
//! immediate flush cycle for its session, so the caller does not wait on the
//! periodic loop.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::stream::MediaUnit;
use crate::ws::frames::now_millis;
use actix_web::{web, HttpResponse};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct MediaSubmission {
    pub session_id: String,
    pub user_id: String,
    /// Base64-encoded media bytes.
    pub data: String,
    #[serde(default)]
    pub sequence: u64,
    /// `is_final` for audio, `is_key_frame` for video; both spellings map
    /// onto the shared marker.
    #[serde(default, alias = "is_final", alias = "is_key_frame")]
    pub marker: bool,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn build_unit(submission: MediaSubmission) -> AppResult<MediaUnit> {
    if submission.session_id.trim().is_empty() {
        return Err(AppError::ValidationError("session_id is required".into()));
    }
    if submission.user_id.trim().is_empty() {
        return Err(AppError::ValidationError("user_id is required".into()));
    }
    let payload = base64::engine::general_purpose::STANDARD.decode(&submission.data)?;
    if payload.is_empty() {
        return Err(AppError::ValidationError("data must not be empty".into()));
    }

    Ok(MediaUnit {
        session_id: submission.session_id,
        user_id: submission.user_id,
        payload,
        timestamp: submission.timestamp.unwrap_or_else(now_millis),
        sequence: submission.sequence,
        marker: submission.marker,
        metadata: submission.metadata,
    })
}

/// `POST /api/v1/streams/audio`
pub async fn submit_audio(
    state: web::Data<AppState>,
    body: web::Json<MediaSubmission>,
) -> AppResult<HttpResponse> {
    let unit = build_unit(body.into_inner())?;
    state.metrics.write().unwrap().media_units_ingested += 1;

    let processed = state
        .audio
        .ingest_and_flush(unit)
        .await
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "processed": processed,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// `POST /api/v1/streams/video`
pub async fn submit_video(
    state: web::Data<AppState>,
    body: web::Json<MediaSubmission>,
) -> AppResult<HttpResponse> {
    let unit = build_unit(body.into_inner())?;
    state.metrics.write().unwrap().media_units_ingested += 1;

    let processed = state
        .video
        .ingest_and_flush(unit)
        .await
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "processed": processed,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};
    use base64::Engine as _;

    fn encoded(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[actix_rt::test]
    async fn audio_submission_persists_and_processes() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/streams/audio", web::post().to(submit_audio)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/streams/audio")
            .set_json(json!({
                "session_id": "s1",
                "user_id": "u1",
                "data": encoded(&[1, 2, 3, 4]),
                "sequence": 0,
            }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["success"], true);
        assert_eq!(body["processed"], true);
        assert_eq!(state.store.media_for("s1").len(), 1);
        // One request record and one result record from the flush.
        assert_eq!(state.store.transcripts_for("s1").len(), 2);
    }

    #[actix_rt::test]
    async fn is_final_spelling_marks_the_audio_unit() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/streams/audio", web::post().to(submit_audio)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/streams/audio")
            .set_json(json!({
                "session_id": "s1",
                "user_id": "u1",
                "data": encoded(&[9, 9]),
                "is_final": true,
            }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["processed"], true);
        let media = state.store.media_for("s1");
        assert_eq!(media.len(), 1);
        assert!(media[0].marker);
    }

    #[actix_rt::test]
    async fn is_key_frame_spelling_triggers_frame_analysis() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/streams/video", web::post().to(submit_video)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/streams/video")
            .set_json(json!({
                "session_id": "v1",
                "user_id": "u1",
                "data": encoded(&[7; 16]),
                "is_key_frame": true,
            }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["processed"], true);
        let summaries = state.store.video_summaries_for("v1");
        assert!(summaries
            .iter()
            .any(|s| s.kind == crate::store::VideoSummaryKind::KeyFrame));
    }

    #[actix_rt::test]
    async fn bad_base64_is_a_bad_request() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/api/v1/streams/video", web::post().to(submit_video)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/streams/video")
            .set_json(json!({
                "session_id": "s1",
                "user_id": "u1",
                "data": "not base64!!",
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn missing_identity_fails_validation() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/api/v1/streams/audio", web::post().to(submit_audio)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/streams/audio")
            .set_json(json!({
                "session_id": "",
                "user_id": "u1",
                "data": encoded(&[1]),
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::UNPROCESSABLE_ENTITY);
    }
}
