//! # Connection Multiplexer
//!
//! One `CallSocket` actor per WebSocket connection. The actor owns nothing
//! shared: it holds its identity (connection, session, user), registers a
//! mailbox handle with the [`ConnectionRegistry`], and dispatches inbound
//! frames per session context rather than per connection. Media frames are
//! relayed verbatim to the session's other participants before any AI
//! processing is considered, so relay latency never depends on the
//! processing pipelines.
//!
//! Disconnect of the last participant ends the session and starts the grace
//! countdown on both stream processors.

pub mod frames;
pub mod registry;

use crate::error::AppError;
use crate::session::{CallType, SessionStatus};
use crate::state::AppState;
use crate::store::{MediaRecord, RecordStore, StatusRecord, TextRecord};
use crate::stream::{MediaKind, MediaUnit};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use base64::Engine;
use chrono::Utc;
use frames::{now_millis, ClientFrame, ServerFrame};
use registry::OutboundFrame;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct CallSocket {
    connection_id: String,
    session_id: String,
    user_id: String,
    call_type: CallType,
    state: AppState,
    last_heartbeat: Instant,
}

impl CallSocket {
    pub fn new(session_id: String, user_id: String, call_type: CallType, state: AppState) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            session_id,
            user_id,
            call_type,
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let streaming = self.state.config.read().unwrap().streaming.clone();
        let interval = Duration::from_secs(streaming.heartbeat_secs);
        let timeout = Duration::from_secs(streaming.client_timeout_secs);

        ctx.run_interval(interval, move |actor, ctx| {
            if Instant::now().duration_since(actor.last_heartbeat) > timeout {
                warn!(
                    connection_id = %actor.connection_id,
                    session_id = %actor.session_id,
                    "Client heartbeat timed out, closing connection"
                );
                ctx.stop();
                return;
            }
            ctx.text(
                ServerFrame::Ping {
                    timestamp: now_millis(),
                }
                .to_json(),
            );
        });
    }

    fn error_frame(&self, code: &str, message: String) -> ServerFrame {
        ServerFrame::Error {
            code: code.to_string(),
            message,
            session_id: Some(self.session_id.clone()),
        }
    }

    /// Handle one inbound text frame. Returns the boundary error frame to
    /// send back, if any; everything else is side effects (relay, ingestion,
    /// status transitions).
    fn dispatch(&mut self, raw: &str) -> Option<ServerFrame> {
        match serde_json::from_str::<ClientFrame>(raw) {
            Ok(ClientFrame::AudioData {
                data,
                sequence,
                is_final,
                process,
                timestamp,
                metadata,
            }) => self.handle_media(
                raw,
                MediaKind::Audio,
                data,
                sequence,
                is_final,
                process,
                timestamp,
                metadata,
            ),
            Ok(ClientFrame::VideoData {
                data,
                sequence,
                is_key_frame,
                process,
                timestamp,
                metadata,
            }) => self.handle_media(
                raw,
                MediaKind::Video,
                data,
                sequence,
                is_key_frame,
                process,
                timestamp,
                metadata,
            ),
            Ok(ClientFrame::TextMessage { text, process, .. }) => {
                self.handle_text_message(raw, text, process);
                None
            }
            Ok(ClientFrame::CallStatus { status }) => self.handle_call_status(status),
            Ok(ClientFrame::Pong { .. }) => {
                self.last_heartbeat = Instant::now();
                None
            }
            Ok(ClientFrame::Unknown) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    "Ignoring frame with unrecognized type"
                );
                None
            }
            Err(err) => {
                warn!(
                    connection_id = %self.connection_id,
                    error = %err,
                    "Ignoring unparseable text frame"
                );
                Some(self.error_frame("invalid_frame", format!("Unparseable frame: {}", err)))
            }
        }
    }

    /// Relay the sender's original frame text to the session's other
    /// participants, byte for byte.
    fn relay_to_peers(&self, raw: &str) {
        self.state
            .connections
            .broadcast_text(&self.session_id, raw, Some(&self.connection_id));
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_media(
        &mut self,
        raw: &str,
        kind: MediaKind,
        data: String,
        sequence: u64,
        marker: bool,
        process: bool,
        timestamp: Option<u64>,
        metadata: Option<serde_json::Value>,
    ) -> Option<ServerFrame> {
        self.state.connections.touch(&self.connection_id);
        self.relay_to_peers(raw);

        let payload = match base64::engine::general_purpose::STANDARD.decode(&data) {
            Ok(bytes) => bytes,
            Err(err) => {
                return Some(self.error_frame(
                    "invalid_payload",
                    format!("Undecodable media payload: {}", err),
                ));
            }
        };

        {
            let mut metrics = self.state.metrics.write().unwrap();
            metrics.media_units_ingested += 1;
        }

        let unit = MediaUnit {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            payload,
            timestamp: timestamp.unwrap_or_else(now_millis),
            sequence,
            marker,
            metadata,
        };

        // Relay has already happened; what remains never blocks the socket.
        // `process` selects AI handling; relay-only frames are persisted but
        // never queued for analysis.
        let audio = self.state.audio.clone();
        let video = self.state.video.clone();
        let store = self.state.store.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if process {
                let result = match kind {
                    MediaKind::Audio => audio.ingest(unit).await,
                    MediaKind::Video => video.ingest(unit).await,
                };
                if let Err(err) = result {
                    warn!(session_id = %session_id, error = %err, "Media ingestion rejected");
                }
                return;
            }

            if let Err(err) = unit.validate() {
                warn!(session_id = %session_id, error = %err, "Rejected malformed relay-only unit");
                return;
            }
            let record = MediaRecord {
                session_id: unit.session_id.clone(),
                user_id: unit.user_id.clone(),
                kind,
                sequence: unit.sequence,
                marker: unit.marker,
                payload_len: unit.payload.len(),
                payload: unit.payload,
                recorded_at: Utc::now(),
            };
            if let Err(err) = store.append_media(record).await {
                warn!(session_id = %session_id, error = %err, "Failed to persist relay-only unit");
            }
        });
        None
    }

    fn handle_text_message(
        &mut self,
        raw: &str,
        text: String,
        process: bool,
    ) {
        self.state.connections.touch(&self.connection_id);

        // Echo to everyone including the sender; the echo doubles as the
        // delivery confirmation.
        self.state
            .connections
            .broadcast_text(&self.session_id, raw, None);

        let store = self.state.store.clone();
        let record = TextRecord {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            text: text.clone(),
            recorded_at: Utc::now(),
        };
        let session_id = self.session_id.clone();
        let audio = self.state.audio.clone();
        tokio::spawn(async move {
            if let Err(err) = store.append_text(record).await {
                warn!(session_id = %session_id, error = %err, "Failed to persist text message");
            }
            if process {
                audio.respond_to_text(&session_id, &text).await;
            }
        });
    }

    fn handle_call_status(&mut self, status: String) -> Option<ServerFrame> {
        let parsed: SessionStatus = match status.parse() {
            Ok(parsed) => parsed,
            Err(err) => return Some(self.error_frame("invalid_status", err)),
        };

        match self.state.sessions.set_status(&self.session_id, parsed) {
            Ok(session) => {
                info!(
                    session_id = %self.session_id,
                    status = %session.status.as_str(),
                    "Session status updated by client"
                );
                let store = self.state.store.clone();
                let record = StatusRecord {
                    session_id: self.session_id.clone(),
                    status: session.status.as_str().to_string(),
                    recorded_at: Utc::now(),
                };
                let session_id = self.session_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = store.append_status(record).await {
                        warn!(session_id = %session_id, error = %err, "Failed to persist status record");
                    }
                });

                // Fan the normalized status out to every participant,
                // including the reporter.
                let frame = ServerFrame::CallStatus {
                    session_id: self.session_id.clone(),
                    status: session.status.as_str().to_string(),
                    timestamp: now_millis(),
                };
                self.state
                    .connections
                    .broadcast_text(&self.session_id, &frame.to_json(), None);
                None
            }
            Err(err) => Some(self.error_frame("illegal_transition", err)),
        }
    }

    /// Everything that happens when this connection goes away. Split from
    /// `Actor::stopped` so the disconnect path is drivable without a live
    /// socket context.
    fn on_disconnect(&mut self) {
        self.state.metrics.write().unwrap().connection_closed();

        let Some((session_id, emptied)) = self.state.connections.unregister(&self.connection_id)
        else {
            return;
        };
        info!(
            connection_id = %self.connection_id,
            session_id = %session_id,
            session_emptied = emptied,
            "WebSocket connection closed"
        );
        if !emptied {
            return;
        }

        // Last participant gone: end the session and start both grace
        // countdowns. Stream state survives the grace window so a quick
        // reconnect resumes where it left off; the registry entry itself is
        // released after the longer (video) grace so introspection of a
        // just-ended call still answers.
        if let Err(err) = self.state.sessions.end(&session_id) {
            debug!(session_id = %session_id, error = %err, "Session already terminal at disconnect");
        }
        let audio = self.state.audio.clone();
        let video = self.state.video.clone();
        let store = self.state.store.clone();
        let sessions = self.state.sessions.clone();
        let grace = self.state.config.read().unwrap().streaming.video_grace();
        tokio::spawn(async move {
            let record = StatusRecord {
                session_id: session_id.clone(),
                status: SessionStatus::Ended.as_str().to_string(),
                recorded_at: Utc::now(),
            };
            if let Err(err) = store.append_status(record).await {
                warn!(session_id = %session_id, error = %err, "Failed to persist end-of-call status");
            }
            audio.end_stream(&session_id).await;
            video.end_stream(&session_id).await;

            tokio::time::sleep(grace).await;
            let still_terminal = sessions
                .get(&session_id)
                .map(|s| s.status.is_terminal())
                .unwrap_or(false);
            if still_terminal {
                sessions.remove(&session_id);
                debug!(session_id = %session_id, "Released session registry entry");
            }
        });
    }
}

impl Actor for CallSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let recipient: Recipient<OutboundFrame> = ctx.address().recipient();
        let count = self.state.connections.register(
            &self.connection_id,
            &self.session_id,
            &self.user_id,
            self.call_type,
            recipient,
        );
        self.state.metrics.write().unwrap().connection_opened();

        info!(
            connection_id = %self.connection_id,
            session_id = %self.session_id,
            user_id = %self.user_id,
            session_connections = count,
            "WebSocket connection established"
        );

        if let Err(err) = self.state.sessions.mark_connected(&self.session_id) {
            // The upgrade handler already vetted the session; a race with a
            // concurrent terminal transition still lands here.
            error!(session_id = %self.session_id, error = %err, "Session refused the connection");
            ctx.stop();
            return;
        }

        ctx.text(
            ServerFrame::Connected {
                connection_id: self.connection_id.clone(),
                session_id: self.session_id.clone(),
                user_id: self.user_id.clone(),
                timestamp: now_millis(),
            }
            .to_json(),
        );

        self.heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.on_disconnect();
    }
}

impl Handler<OutboundFrame> for CallSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                if let Some(frame) = self.dispatch(&text) {
                    ctx.text(frame.to_json());
                }
            }
            Ok(ws::Message::Binary(_)) => {
                // Media travels as base64 inside JSON frames on this
                // endpoint; raw binary is not part of the protocol.
                warn!(
                    connection_id = %self.connection_id,
                    "Ignoring unexpected binary frame"
                );
            }
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    "Client closed the connection"
                );
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(err) => {
                error!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    error = %err,
                    "WebSocket protocol error"
                );
                if let Err(fail_err) = self.state.sessions.fail(&self.session_id) {
                    debug!(session_id = %self.session_id, error = %fail_err, "Session already terminal");
                }
                ctx.stop();
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub session_id: String,
    pub user_id: String,
    pub call_type: String,
}

/// HTTP upgrade handler for `/ws/call`.
///
/// Identity comes from query parameters, validated before the handshake so a
/// malformed connect is refused as plain HTTP. An unknown `session_id` gets a
/// session created on the fly; a terminal one is refused.
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<ConnectQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let query = query.into_inner();
    if query.session_id.trim().is_empty() {
        return Err(AppError::BadRequest("session_id must not be empty".into()));
    }
    if query.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user_id must not be empty".into()));
    }
    let call_type: CallType = query
        .call_type
        .parse()
        .map_err(AppError::BadRequest)?;

    match state.sessions.get(&query.session_id) {
        Some(session) if session.status.is_terminal() => {
            return Err(AppError::BadRequest(format!(
                "Session '{}' is {} and accepts no new connections",
                query.session_id,
                session.status.as_str()
            )));
        }
        Some(_) => {}
        None => {
            state
                .sessions
                .create(Some(query.session_id.clone()), call_type, None)
                .map_err(AppError::BadRequest)?;
            debug!(session_id = %query.session_id, "Created session on first connect");
        }
    }

    let socket = CallSocket::new(
        query.session_id,
        query.user_id,
        call_type,
        state.get_ref().clone(),
    );
    ws::start(socket, &req, stream).map_err(|e| AppError::InternalError(e.to_string()))
}
