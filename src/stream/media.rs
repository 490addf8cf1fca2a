//! Shared media model for both stream processors.
//!
//! A `MediaUnit` is one fragment of streamed media (audio chunk or video
//! frame). Sequence numbers are advisory: they order units for diagnostics
//! and traceability, but the system does not promise strict in-order
//! delivery. What it does promise is that every unit is durably recorded with
//! its original sequence before it can fall out of the live queue.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Which media stream a unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// One fragment of streamed media.
#[derive(Debug, Clone)]
pub struct MediaUnit {
    pub session_id: String,
    pub user_id: String,
    /// Opaque encoded bytes; the coordinator never inspects codecs.
    pub payload: Vec<u8>,
    /// Client-side capture timestamp (milliseconds since epoch).
    pub timestamp: u64,
    /// Monotonically increasing within one session and media type.
    pub sequence: u64,
    /// `is_final` for audio (end of utterance), `is_key_frame` for video.
    pub marker: bool,
    pub metadata: Option<serde_json::Value>,
}

impl MediaUnit {
    /// Boundary validation: a unit with a missing identifier or empty payload
    /// never enters a queue.
    pub fn validate(&self) -> Result<(), String> {
        if self.session_id.is_empty() {
            return Err("session_id is required".to_string());
        }
        if self.user_id.is_empty() {
            return Err("user_id is required".to_string());
        }
        if self.payload.is_empty() {
            return Err("payload must not be empty".to_string());
        }
        Ok(())
    }
}

/// Per-session, per-media-type processing context.
///
/// Owned exclusively by one stream processor; drained only by that
/// processor's own timer or an explicit final-flush trigger, so no two drains
/// of the same queue ever race.
pub struct StreamState {
    pub is_active: bool,
    pub last_activity: Instant,
    /// Pending units not yet drained by a flush.
    pub live_queue: Vec<MediaUnit>,
    /// Units drained and analyzed over the session's lifetime.
    pub processed_units: usize,
    /// Video only: gates the aggregate-loop response trigger.
    pub participant_count: usize,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            is_active: true,
            last_activity: Instant::now(),
            live_queue: Vec::new(),
            processed_units: 0,
            participant_count: 0,
        }
    }

    /// Append a unit, evicting the oldest entry past `max_queue_len`.
    ///
    /// Eviction is a safety valve against a stalled flush loop; evicted units
    /// have already been persisted at ingestion, so only their live-cycle
    /// analysis is lost.
    pub fn push(&mut self, unit: MediaUnit, max_queue_len: usize) -> bool {
        self.last_activity = Instant::now();
        let mut evicted = false;
        if self.live_queue.len() >= max_queue_len {
            self.live_queue.remove(0);
            evicted = true;
        }
        self.live_queue.push(unit);
        evicted
    }

    /// Take the pending queue, leaving it empty.
    pub fn drain(&mut self) -> Vec<MediaUnit> {
        std::mem::take(&mut self.live_queue)
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}
