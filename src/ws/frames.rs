//! Wire envelope for the call WebSocket.
//!
//! Every message is a JSON object tagged by `type`. Client frames carry media
//! payloads base64-encoded; peer relay re-broadcasts the original text
//! verbatim, so relayed frames are byte-identical to what the sender wrote.
//! Unrecognized frame kinds deserialize to [`ClientFrame::Unknown`] and are
//! logged, not fatal to the connection.

use serde::{Deserialize, Serialize};

/// Messages a participant may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// One audio chunk. `process` asks for AI handling on top of peer relay.
    #[serde(rename = "audio_data")]
    AudioData {
        /// Base64-encoded opaque audio bytes.
        data: String,
        #[serde(default)]
        sequence: u64,
        /// End-of-utterance marker; triggers an immediate flush.
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        process: bool,
        #[serde(default)]
        timestamp: Option<u64>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },

    /// One video frame. `is_key_frame` selects the synchronous analysis path.
    #[serde(rename = "video_data")]
    VideoData {
        /// Base64-encoded opaque frame bytes.
        data: String,
        #[serde(default)]
        sequence: u64,
        #[serde(default)]
        is_key_frame: bool,
        #[serde(default)]
        process: bool,
        #[serde(default)]
        timestamp: Option<u64>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },

    /// Chat text; echoed back to the sender as delivery confirmation.
    #[serde(rename = "text_message")]
    TextMessage {
        text: String,
        /// Forward to the AI pipeline for a generated reply.
        #[serde(default)]
        process: bool,
        #[serde(default)]
        timestamp: Option<u64>,
    },

    /// Client-reported call status transition.
    #[serde(rename = "call_status")]
    CallStatus { status: String },

    /// Heartbeat response.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        timestamp: u64,
    },

    /// Any frame kind this server does not understand. Logged as invalid
    /// input; no other effect.
    #[serde(other)]
    Unknown,
}

/// Messages the server originates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Connect acknowledgment, first frame on every new connection.
    #[serde(rename = "connected")]
    Connected {
        connection_id: String,
        session_id: String,
        user_id: String,
        timestamp: u64,
    },

    /// Synthesized audio reply from the speech pipeline, with its transcript.
    #[serde(rename = "ai_audio_reply")]
    AiAudioReply {
        session_id: String,
        audio_id: String,
        transcript: String,
        duration_ms: u64,
        timestamp: u64,
    },

    /// Generated video reply reference.
    #[serde(rename = "ai_video_reply")]
    AiVideoReply {
        session_id: String,
        video_id: String,
        timestamp: u64,
    },

    /// AI-generated chat reply to a forwarded text message.
    #[serde(rename = "ai_text_reply")]
    AiTextReply {
        session_id: String,
        text: String,
        timestamp: u64,
    },

    /// Normalized session status, fanned out to all participants.
    #[serde(rename = "call_status")]
    CallStatus {
        session_id: String,
        status: String,
        timestamp: u64,
    },

    /// Boundary rejection of a malformed client frame.
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },

    /// Heartbeat probe.
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        // ServerFrame contains only serializable leaves; this cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Milliseconds since the epoch, the timestamp unit used on the wire.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
