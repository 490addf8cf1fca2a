//! # Video Stream Processor
//!
//! Mirrors the audio processor with a dual-path design:
//!
//! - **Key-frame fast path**: key frames are rare and information-dense, so
//!   they are analyzed synchronously at ingestion, outside the periodic loop.
//!   An analysis flagging `requires_response` triggers the video response
//!   pipeline immediately.
//! - **Aggregate path**: continuous frames are numerous and individually
//!   low-value; the flush loop (default 200 ms) amortizes them into window
//!   aggregates (estimated frame rate, movement presence, and a quality
//!   score from the key-frame proportion) and triggers an ambient video
//!   response when movement is seen and a participant is present.
//!
//! Participant count arrives as an external signal and gates only the
//! aggregate-loop trigger; it never affects ingestion.

use crate::config::StreamingConfig;
use crate::pipeline::{FrameAnalyzer, VideoResponder};
use crate::store::{MediaRecord, RecordStore, VideoSummaryKind, VideoSummaryRecord};
use crate::stream::media::{MediaKind, MediaUnit, StreamState};
use crate::ws::frames::{now_millis, ServerFrame};
use crate::ws::registry::SessionBroadcast;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Window quality derived from the proportion of key frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowQuality {
    High,
    Medium,
    Low,
}

impl WindowQuality {
    /// >30% key frames -> high, >10% -> medium, else low.
    pub fn from_key_frame_ratio(ratio: f64) -> Self {
        if ratio > 0.3 {
            WindowQuality::High
        } else if ratio > 0.1 {
            WindowQuality::Medium
        } else {
            WindowQuality::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowQuality::High => "high",
            WindowQuality::Medium => "medium",
            WindowQuality::Low => "low",
        }
    }
}

pub struct VideoStreamProcessor {
    /// Exclusively-owned per-session state; same locking discipline as the
    /// audio processor (never held across an await).
    states: RwLock<HashMap<String, StreamState>>,
    store: Arc<dyn RecordStore>,
    analyzer: Arc<dyn FrameAnalyzer>,
    responder: Arc<dyn VideoResponder>,
    broadcast: Arc<dyn SessionBroadcast>,
    streaming: StreamingConfig,
    max_queue_len: usize,
}

impl VideoStreamProcessor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        analyzer: Arc<dyn FrameAnalyzer>,
        responder: Arc<dyn VideoResponder>,
        broadcast: Arc<dyn SessionBroadcast>,
        streaming: StreamingConfig,
        max_queue_len: usize,
    ) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            store,
            analyzer,
            responder,
            broadcast,
            streaming,
            max_queue_len,
        }
    }

    /// Queue one frame and persist it. Key frames additionally run the
    /// synchronous analysis path; returns whether that analysis completed.
    pub async fn ingest(&self, unit: MediaUnit) -> Result<bool, String> {
        unit.validate()?;
        let session_id = unit.session_id.clone();
        let record = media_record(&unit);

        {
            let mut states = self.states.write().unwrap();
            let state = states.entry(session_id.clone()).or_default();
            state.is_active = true;
            if state.push(unit.clone(), self.max_queue_len) {
                warn!(session_id = %session_id, "Video queue full, evicted oldest frame");
            }
        }

        if let Err(err) = self.store.append_media(record).await {
            warn!(session_id = %session_id, error = %err, "Failed to persist video frame");
        }

        if unit.marker {
            return Ok(self.analyze_key_frame(&unit).await);
        }
        Ok(false)
    }

    /// Fallback request/response path: ingest, then one aggregation cycle for
    /// the unit's session. Returns whether any analysis ran.
    pub async fn ingest_and_flush(&self, unit: MediaUnit) -> Result<bool, String> {
        let session_id = unit.session_id.clone();
        let analyzed = self.ingest(unit).await?;
        let aggregated = self.flush_session(&session_id).await;
        Ok(analyzed || aggregated)
    }

    /// Synchronous key-frame analysis, outside the periodic loop.
    async fn analyze_key_frame(&self, unit: &MediaUnit) -> bool {
        let session_id = unit.session_id.as_str();
        let analysis = match self.analyzer.analyze_frame(session_id, unit).await {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(
                    session_id = %session_id,
                    sequence = unit.sequence,
                    error = %err,
                    "Key-frame analysis failed"
                );
                return false;
            }
        };

        if let Err(err) = self
            .store
            .append_video_summary(VideoSummaryRecord {
                session_id: session_id.to_string(),
                kind: VideoSummaryKind::KeyFrame,
                first_sequence: unit.sequence,
                last_sequence: unit.sequence,
                detail: analysis.to_detail(),
                recorded_at: Utc::now(),
            })
            .await
        {
            warn!(session_id = %session_id, error = %err, "Failed to persist key-frame analysis");
        }

        if analysis.requires_response {
            // Discrete-event response, fired ahead of the next periodic tick.
            let context = json!({
                "trigger": "key_frame",
                "sequence": unit.sequence,
                "hint": analysis.response_hint,
            });
            self.generate_and_broadcast(session_id, &context).await;
        }
        true
    }

    /// One iteration of the aggregation loop; directly callable from tests.
    /// Returns the number of sessions aggregated.
    pub async fn flush_tick(&self) -> usize {
        let batches: Vec<(String, Vec<MediaUnit>, usize)> = {
            let mut states = self.states.write().unwrap();
            states
                .iter_mut()
                .filter(|(_, state)| !state.live_queue.is_empty())
                .map(|(session_id, state)| {
                    (session_id.clone(), state.drain(), state.participant_count)
                })
                .collect()
        };

        let drained = batches.len();
        for (session_id, units, participants) in batches {
            self.aggregate_window(&session_id, units, participants).await;
        }
        drained
    }

    /// Drain and aggregate one session's queue; no-op when empty.
    pub async fn flush_session(&self, session_id: &str) -> bool {
        let (units, participants) = {
            let mut states = self.states.write().unwrap();
            match states.get_mut(session_id) {
                Some(state) if !state.live_queue.is_empty() => {
                    (state.drain(), state.participant_count)
                }
                _ => return false,
            }
        };
        self.aggregate_window(session_id, units, participants).await;
        true
    }

    async fn aggregate_window(
        &self,
        session_id: &str,
        units: Vec<MediaUnit>,
        participants: usize,
    ) {
        let unit_count = units.len();
        let key_frames = units.iter().filter(|u| u.marker).count();
        let key_ratio = key_frames as f64 / unit_count as f64;
        let quality = WindowQuality::from_key_frame_ratio(key_ratio);
        // Frame rate estimated against the aggregation window itself.
        let estimated_fps = unit_count as f64 * 1000.0 / self.streaming.video_flush_ms as f64;
        let movement = unit_count >= self.streaming.movement_min_units;
        let first_sequence = units.first().map(|u| u.sequence).unwrap_or(0);
        let last_sequence = units.last().map(|u| u.sequence).unwrap_or(0);

        if let Err(err) = self
            .store
            .append_video_summary(VideoSummaryRecord {
                session_id: session_id.to_string(),
                kind: VideoSummaryKind::Aggregate,
                first_sequence,
                last_sequence,
                detail: json!({
                    "unit_count": unit_count,
                    "key_frame_ratio": key_ratio,
                    "estimated_fps": estimated_fps,
                    "movement": movement,
                    "quality": quality.as_str(),
                }),
                recorded_at: Utc::now(),
            })
            .await
        {
            warn!(session_id = %session_id, error = %err, "Failed to persist window aggregate");
        }

        {
            let mut states = self.states.write().unwrap();
            if let Some(state) = states.get_mut(session_id) {
                state.processed_units += unit_count;
            }
        }

        // Ambient reaction path: ongoing movement with someone on the call,
        // distinct from the discrete key-frame trigger.
        if movement && participants >= 1 {
            let context = json!({
                "trigger": "ambient",
                "estimated_fps": estimated_fps,
                "quality": quality.as_str(),
            });
            self.generate_and_broadcast(session_id, &context).await;
        }
    }

    async fn generate_and_broadcast(&self, session_id: &str, context: &serde_json::Value) {
        match self.responder.generate(session_id, context).await {
            Ok(video_ref) => {
                let frame = ServerFrame::AiVideoReply {
                    session_id: session_id.to_string(),
                    video_id: video_ref.video_id,
                    timestamp: now_millis(),
                };
                let deliveries = self.broadcast.broadcast(session_id, &frame);
                debug!(
                    session_id = %session_id,
                    deliveries = deliveries.len(),
                    "Broadcast generated video reply"
                );
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Video response generation failed");
            }
        }
    }

    /// External participant-count signal from the multiplexer or session
    /// metadata. Gates only the aggregate response trigger.
    pub fn update_participant_count(&self, session_id: &str, count: usize) {
        let mut states = self.states.write().unwrap();
        let state = states.entry(session_id.to_string()).or_default();
        state.participant_count = count;
    }

    /// Same contract as the audio variant, with the longer video grace delay.
    pub async fn end_stream(self: &Arc<Self>, session_id: &str) {
        let known = {
            let mut states = self.states.write().unwrap();
            match states.get_mut(session_id) {
                Some(state) => {
                    state.is_active = false;
                    true
                }
                None => false,
            }
        };
        if !known {
            return;
        }

        self.flush_session(session_id).await;

        let processor = Arc::clone(self);
        let session_id = session_id.to_string();
        let grace = self.streaming.video_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut states = processor.states.write().unwrap();
            if let Some(state) = states.get(&session_id) {
                if !state.is_active {
                    states.remove(&session_id);
                    info!(session_id = %session_id, "Disposed video stream state");
                }
            }
        });
    }

    pub fn spawn_flush_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.streaming.video_flush_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.flush_tick().await;
            }
        })
    }

    pub fn has_state(&self, session_id: &str) -> bool {
        self.states.read().unwrap().contains_key(session_id)
    }

    pub fn queue_len(&self, session_id: &str) -> usize {
        self.states
            .read()
            .unwrap()
            .get(session_id)
            .map(|s| s.live_queue.len())
            .unwrap_or(0)
    }

    pub fn state_count(&self) -> usize {
        self.states.read().unwrap().len()
    }
}

fn media_record(unit: &MediaUnit) -> MediaRecord {
    MediaRecord {
        session_id: unit.session_id.clone(),
        user_id: unit.user_id.clone(),
        kind: MediaKind::Video,
        sequence: unit.sequence,
        marker: unit.marker,
        payload_len: unit.payload.len(),
        payload: unit.payload.clone(),
        recorded_at: Utc::now(),
    }
}
