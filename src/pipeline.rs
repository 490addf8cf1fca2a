//! # Downstream AI Pipelines
//!
//! The coordinator never runs speech or vision analysis itself; it invokes
//! opaque request/response collaborators and consumes their results. These
//! traits are that seam. The server wires vendor clients in production and
//! the processors are handed trait objects, so tests substitute recording
//! mocks without touching the flush logic.
//!
//! None of these calls carry a hard timeout. Ending a session is advisory,
//! and the grace-delay disposal in the stream processors exists to absorb
//! late completions.

use crate::stream::MediaUnit;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::json;

/// Result of one speech-to-text/response cycle over a drained batch of audio
/// units.
#[derive(Debug, Clone, Serialize)]
pub struct SpeechAnalysis {
    pub transcript: String,
    /// Present when the pipeline also generated a support-agent reply.
    pub reply: Option<String>,
}

/// Reference to a synthesized audio asset, addressable by the client.
#[derive(Debug, Clone, Serialize)]
pub struct AudioRef {
    pub audio_id: String,
    pub duration_ms: u64,
}

/// Heuristic tags for a single analyzed key frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameAnalysis {
    pub presence: bool,
    pub emotion: Option<String>,
    pub gesture: Option<String>,
    /// The analyzer decided this frame warrants an immediate AI response.
    pub requires_response: bool,
    pub response_hint: Option<String>,
}

/// Reference to a generated video response asset.
#[derive(Debug, Clone, Serialize)]
pub struct VideoRef {
    pub video_id: String,
}

/// Speech-to-text plus optional reply generation: unit list in, transcript
/// (and maybe reply text) out. The same collaborator answers forwarded chat
/// text through [`SpeechPipeline::respond`].
pub trait SpeechPipeline: Send + Sync {
    fn analyze<'a>(
        &'a self,
        session_id: &'a str,
        units: &'a [MediaUnit],
    ) -> BoxFuture<'a, Result<SpeechAnalysis, String>>;

    /// Generate a reply to a plain text message, when the vendor has one.
    fn respond<'a>(
        &'a self,
        session_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, String>>;
}

/// Text in, audio reference out.
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize<'a>(
        &'a self,
        session_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<AudioRef, String>>;
}

/// Single frame in, heuristic tags out.
pub trait FrameAnalyzer: Send + Sync {
    fn analyze_frame<'a>(
        &'a self,
        session_id: &'a str,
        frame: &'a MediaUnit,
    ) -> BoxFuture<'a, Result<FrameAnalysis, String>>;
}

/// Script/context in, video reference out.
pub trait VideoResponder: Send + Sync {
    fn generate<'a>(
        &'a self,
        session_id: &'a str,
        context: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<VideoRef, String>>;
}

/// Placeholder collaborators used when no vendor is configured.
///
/// Speech analysis yields empty transcripts and no replies; frame analysis
/// never requests a response. Keeps the full pipeline exercisable in
/// development without external credentials.
pub struct NoopPipelines;

impl SpeechPipeline for NoopPipelines {
    fn analyze<'a>(
        &'a self,
        session_id: &'a str,
        units: &'a [MediaUnit],
    ) -> BoxFuture<'a, Result<SpeechAnalysis, String>> {
        Box::pin(async move {
            tracing::debug!(
                session_id = %session_id,
                unit_count = units.len(),
                "Noop speech pipeline invoked"
            );
            Ok(SpeechAnalysis {
                transcript: String::new(),
                reply: None,
            })
        })
    }

    fn respond<'a>(
        &'a self,
        _session_id: &'a str,
        _text: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, String>> {
        Box::pin(async move { Ok(None) })
    }
}

impl SpeechSynthesizer for NoopPipelines {
    fn synthesize<'a>(
        &'a self,
        _session_id: &'a str,
        _text: &'a str,
    ) -> BoxFuture<'a, Result<AudioRef, String>> {
        Box::pin(async move {
            Ok(AudioRef {
                audio_id: format!("noop-{}", uuid::Uuid::new_v4()),
                duration_ms: 0,
            })
        })
    }
}

impl FrameAnalyzer for NoopPipelines {
    fn analyze_frame<'a>(
        &'a self,
        _session_id: &'a str,
        _frame: &'a MediaUnit,
    ) -> BoxFuture<'a, Result<FrameAnalysis, String>> {
        Box::pin(async move {
            Ok(FrameAnalysis {
                presence: false,
                emotion: None,
                gesture: None,
                requires_response: false,
                response_hint: None,
            })
        })
    }
}

impl VideoResponder for NoopPipelines {
    fn generate<'a>(
        &'a self,
        session_id: &'a str,
        _context: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<VideoRef, String>> {
        Box::pin(async move {
            tracing::debug!(session_id = %session_id, "Noop video responder invoked");
            Ok(VideoRef {
                video_id: format!("noop-{}", uuid::Uuid::new_v4()),
            })
        })
    }
}

impl FrameAnalysis {
    /// JSON shape persisted into video summary records.
    pub fn to_detail(&self) -> serde_json::Value {
        json!({
            "presence": self.presence,
            "emotion": self.emotion,
            "gesture": self.gesture,
            "requires_response": self.requires_response,
            "response_hint": self.response_hint,
        })
    }
}
