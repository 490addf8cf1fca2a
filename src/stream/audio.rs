//! # Audio Stream Processor
//!
//! Converts a live audio stream into buffered, periodically-flushed batches
//! for asynchronous speech analysis, and routes analysis results back out.
//!
//! ## Flow:
//! 1. `ingest` queues one chunk per session and persists it immediately
//! 2. the background flush loop (default 100 ms) drains each non-empty queue
//!    into one speech-pipeline call
//! 3. a generated reply is synthesized and broadcast to the whole session
//!
//! A chunk marked `is_final` (end of utterance) flushes its session out of
//! band so response latency is not held hostage to the timer. A failed
//! downstream call is logged and not retried; the affected units survive only
//! in the append log for offline reprocessing.

use crate::config::StreamingConfig;
use crate::pipeline::{SpeechPipeline, SpeechSynthesizer};
use crate::store::{MediaRecord, RecordStore, TextRecord, TranscriptRecord};
use crate::stream::media::{MediaKind, MediaUnit, StreamState};
use crate::ws::frames::{now_millis, ServerFrame};
use crate::ws::registry::SessionBroadcast;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub struct AudioStreamProcessor {
    /// Exclusively-owned per-session processing state. Never held across an
    /// await: queues are swapped out under the lock and processed after it is
    /// released, so a session's queue can never be drained twice
    /// concurrently.
    states: RwLock<HashMap<String, StreamState>>,
    store: Arc<dyn RecordStore>,
    speech: Arc<dyn SpeechPipeline>,
    synth: Arc<dyn SpeechSynthesizer>,
    broadcast: Arc<dyn SessionBroadcast>,
    streaming: StreamingConfig,
    max_queue_len: usize,
}

impl AudioStreamProcessor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        speech: Arc<dyn SpeechPipeline>,
        synth: Arc<dyn SpeechSynthesizer>,
        broadcast: Arc<dyn SessionBroadcast>,
        streaming: StreamingConfig,
        max_queue_len: usize,
    ) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            store,
            speech,
            synth,
            broadcast,
            streaming,
            max_queue_len,
        }
    }

    /// Queue one audio chunk and persist it.
    ///
    /// Returns whether the chunk's `is_final` marker caused an immediate
    /// flush. Malformed units are rejected before touching any queue.
    pub async fn ingest(&self, unit: MediaUnit) -> Result<bool, String> {
        unit.validate()?;
        let session_id = unit.session_id.clone();
        let record = media_record(&unit);

        {
            let mut states = self.states.write().unwrap();
            let state = states.entry(session_id.clone()).or_default();
            // Late units after an end-stream reactivate the state; disposal
            // checks this flag again after the grace delay.
            state.is_active = true;
            if state.push(unit.clone(), self.max_queue_len) {
                warn!(session_id = %session_id, "Audio queue full, evicted oldest chunk");
            }
        }

        // Persisted at ingestion time, before any flush outcome is known.
        if let Err(err) = self.store.append_media(record).await {
            warn!(session_id = %session_id, error = %err, "Failed to persist audio chunk");
        }

        if unit_is_final(&unit) {
            debug!(session_id = %session_id, sequence = unit.sequence, "Final chunk, flushing out of band");
            self.flush_session(&session_id).await;
            return Ok(true);
        }
        Ok(false)
    }

    /// Fallback request/response path: ingest, then wait synchronously for
    /// one flush-and-analyze cycle. Returns whether an analysis ran.
    pub async fn ingest_and_flush(&self, unit: MediaUnit) -> Result<bool, String> {
        let session_id = unit.session_id.clone();
        if self.ingest(unit).await? {
            return Ok(true);
        }
        Ok(self.flush_session(&session_id).await)
    }

    /// One iteration of the background flush loop. Drains every session with
    /// a non-empty queue and feeds each batch to the speech pipeline
    /// sequentially. Returns the number of sessions drained.
    ///
    /// Directly callable so tests drive ticks synchronously instead of
    /// relying on wall-clock timing.
    pub async fn flush_tick(&self) -> usize {
        let batches: Vec<(String, Vec<MediaUnit>)> = {
            let mut states = self.states.write().unwrap();
            states
                .iter_mut()
                .filter(|(_, state)| !state.live_queue.is_empty())
                .map(|(session_id, state)| (session_id.clone(), state.drain()))
                .collect()
        };

        let drained = batches.len();
        for (session_id, units) in batches {
            // One failed session must not starve the rest of the tick.
            self.process_batch(&session_id, units).await;
        }
        drained
    }

    /// Drain and analyze a single session's queue. No-op when empty: no
    /// downstream call, no persisted record.
    pub async fn flush_session(&self, session_id: &str) -> bool {
        let units = {
            let mut states = self.states.write().unwrap();
            match states.get_mut(session_id) {
                Some(state) if !state.live_queue.is_empty() => state.drain(),
                _ => return false,
            }
        };
        self.process_batch(session_id, units).await
    }

    async fn process_batch(&self, session_id: &str, units: Vec<MediaUnit>) -> bool {
        let first_sequence = units.first().map(|u| u.sequence).unwrap_or(0);
        let last_sequence = units.last().map(|u| u.sequence).unwrap_or(0);
        let unit_count = units.len();

        // Transcription request record, written before the pipeline call.
        if let Err(err) = self
            .store
            .append_transcript(TranscriptRecord {
                session_id: session_id.to_string(),
                unit_count,
                first_sequence,
                last_sequence,
                transcript: None,
                reply: None,
                recorded_at: Utc::now(),
            })
            .await
        {
            warn!(session_id = %session_id, error = %err, "Failed to persist transcription request");
        }

        let analysis = match self.speech.analyze(session_id, &units).await {
            Ok(analysis) => analysis,
            Err(err) => {
                // Log and continue: the raw chunks stay in the append log for
                // offline reprocessing, nothing is re-queued.
                warn!(
                    session_id = %session_id,
                    unit_count,
                    error = %err,
                    "Speech analysis failed, dropping batch from live processing"
                );
                return false;
            }
        };

        if let Err(err) = self
            .store
            .append_transcript(TranscriptRecord {
                session_id: session_id.to_string(),
                unit_count,
                first_sequence,
                last_sequence,
                transcript: Some(analysis.transcript.clone()),
                reply: analysis.reply.clone(),
                recorded_at: Utc::now(),
            })
            .await
        {
            warn!(session_id = %session_id, error = %err, "Failed to persist transcription result");
        }

        {
            let mut states = self.states.write().unwrap();
            if let Some(state) = states.get_mut(session_id) {
                state.processed_units += unit_count;
            }
        }

        if let Some(reply) = analysis.reply {
            self.synthesize_and_broadcast(session_id, &reply).await;
        }
        true
    }

    async fn synthesize_and_broadcast(&self, session_id: &str, reply: &str) {
        match self.synth.synthesize(session_id, reply).await {
            Ok(audio_ref) => {
                let frame = ServerFrame::AiAudioReply {
                    session_id: session_id.to_string(),
                    audio_id: audio_ref.audio_id,
                    transcript: reply.to_string(),
                    duration_ms: audio_ref.duration_ms,
                    timestamp: now_millis(),
                };
                let deliveries = self.broadcast.broadcast(session_id, &frame);
                debug!(
                    session_id = %session_id,
                    deliveries = deliveries.len(),
                    "Broadcast synthesized audio reply"
                );
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Speech synthesis failed");
            }
        }
    }

    /// Generate and fan out an AI reply to a forwarded chat message.
    pub async fn respond_to_text(&self, session_id: &str, text: &str) {
        match self.speech.respond(session_id, text).await {
            Ok(Some(reply)) => {
                if let Err(err) = self
                    .store
                    .append_text(TextRecord {
                        session_id: session_id.to_string(),
                        user_id: "assistant".to_string(),
                        text: reply.clone(),
                        recorded_at: Utc::now(),
                    })
                    .await
                {
                    warn!(session_id = %session_id, error = %err, "Failed to persist AI text reply");
                }
                let frame = ServerFrame::AiTextReply {
                    session_id: session_id.to_string(),
                    text: reply,
                    timestamp: now_millis(),
                };
                self.broadcast.broadcast(session_id, &frame);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Text response generation failed");
            }
        }
    }

    /// Mark a session's stream inactive, force a final flush, and schedule
    /// StreamState disposal after the configured grace delay. The delay
    /// absorbs in-flight late chunks; a state that became active again in the
    /// meantime is left alone.
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
        let grace = self.streaming.audio_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut states = processor.states.write().unwrap();
            if let Some(state) = states.get(&session_id) {
                if !state.is_active {
                    states.remove(&session_id);
                    info!(session_id = %session_id, "Disposed audio stream state");
                }
            }
        });
    }

    /// Spawn the periodic flush loop. Runs until the handle is aborted at
    /// shutdown.
    pub fn spawn_flush_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.streaming.audio_flush_interval();
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
        kind: MediaKind::Audio,
        sequence: unit.sequence,
        marker: unit.marker,
        payload_len: unit.payload.len(),
        payload: unit.payload.clone(),
        recorded_at: Utc::now(),
    }
}

fn unit_is_final(unit: &MediaUnit) -> bool {
    unit.marker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::{AudioRef, SpeechAnalysis};
    use crate::store::MemoryStore;
    use crate::ws::registry::Delivery;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockSpeech {
        /// Sequence lists from every analyze call.
        calls: Mutex<Vec<Vec<u64>>>,
        reply: Option<String>,
        fail: bool,
    }

    impl MockSpeech {
        fn new(reply: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: reply.map(|s| s.to_string()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: None,
                fail: true,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl SpeechPipeline for MockSpeech {
        fn analyze<'a>(
            &'a self,
            _session_id: &'a str,
            units: &'a [MediaUnit],
        ) -> BoxFuture<'a, Result<SpeechAnalysis, String>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push(units.iter().map(|u| u.sequence).collect());
                if self.fail {
                    return Err("vendor unavailable".to_string());
                }
                Ok(SpeechAnalysis {
                    transcript: "transcribed".to_string(),
                    reply: self.reply.clone(),
                })
            })
        }

        fn respond<'a>(
            &'a self,
            _session_id: &'a str,
            text: &'a str,
        ) -> BoxFuture<'a, Result<Option<String>, String>> {
            Box::pin(async move { Ok(Some(format!("re: {}", text))) })
        }
    }

    struct MockSynth {
        calls: AtomicUsize,
    }

    impl SpeechSynthesizer for MockSynth {
        fn synthesize<'a>(
            &'a self,
            _session_id: &'a str,
            _text: &'a str,
        ) -> BoxFuture<'a, Result<AudioRef, String>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(AudioRef {
                    audio_id: "audio-1".to_string(),
                    duration_ms: 1200,
                })
            })
        }
    }

    #[derive(Default)]
    struct MockBroadcast {
        frames: Mutex<Vec<ServerFrame>>,
    }

    impl SessionBroadcast for MockBroadcast {
        fn broadcast(&self, _session_id: &str, frame: &ServerFrame) -> Vec<Delivery> {
            self.frames.lock().unwrap().push(frame.clone());
            Vec::new()
        }
    }

    struct Harness {
        processor: Arc<AudioStreamProcessor>,
        store: Arc<MemoryStore>,
        speech: Arc<MockSpeech>,
        synth: Arc<MockSynth>,
        broadcast: Arc<MockBroadcast>,
    }

    fn harness_with(speech: Arc<MockSpeech>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let synth = Arc::new(MockSynth {
            calls: AtomicUsize::new(0),
        });
        let broadcast = Arc::new(MockBroadcast::default());
        let config = AppConfig::default();
        let processor = Arc::new(AudioStreamProcessor::new(
            store.clone(),
            speech.clone(),
            synth.clone(),
            broadcast.clone(),
            config.streaming,
            config.limits.max_queue_len,
        ));
        Harness {
            processor,
            store,
            speech,
            synth,
            broadcast,
        }
    }

    fn unit(seq: u64, is_final: bool) -> MediaUnit {
        MediaUnit {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            payload: vec![0xAA; 32],
            timestamp: 1_700_000_000_000 + seq,
            sequence: seq,
            marker: is_final,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn ingest_persists_before_any_flush() {
        let h = harness_with(MockSpeech::new(None));
        h.processor.ingest(unit(0, false)).await.unwrap();

        let media = h.store.media_for("s1");
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].sequence, 0);
        assert_eq!(media[0].payload.len(), 32);
        // Nothing analyzed yet.
        assert_eq!(h.speech.call_count(), 0);
        assert_eq!(h.processor.queue_len("s1"), 1);
    }

    #[tokio::test]
    async fn ingest_rejects_malformed_units() {
        let h = harness_with(MockSpeech::new(None));
        let mut bad = unit(0, false);
        bad.payload.clear();
        assert!(h.processor.ingest(bad).await.is_err());
        assert_eq!(h.store.media_count(), 0);
        assert_eq!(h.processor.queue_len("s1"), 0);
    }

    #[tokio::test]
    async fn one_tick_batches_all_pending_units() {
        // Scenario: 3 non-final units inside one flush interval produce
        // exactly one downstream call containing all 3.
        let h = harness_with(MockSpeech::new(None));
        for seq in 0..3 {
            h.processor.ingest(unit(seq, false)).await.unwrap();
        }

        let drained = h.processor.flush_tick().await;
        assert_eq!(drained, 1);
        let calls = h.speech.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![0, 1, 2]);
        drop(calls);
        assert_eq!(h.processor.queue_len("s1"), 0);
    }

    #[tokio::test]
    async fn empty_tick_is_a_noop() {
        let h = harness_with(MockSpeech::new(None));
        assert_eq!(h.processor.flush_tick().await, 0);
        assert_eq!(h.speech.call_count(), 0);
        assert_eq!(h.store.transcript_count(), 0);
    }

    #[tokio::test]
    async fn final_unit_flushes_without_waiting_for_the_timer() {
        let h = harness_with(MockSpeech::new(None));
        h.processor.ingest(unit(0, false)).await.unwrap();
        let flushed = h.processor.ingest(unit(1, true)).await.unwrap();

        assert!(flushed);
        let calls = h.speech.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![0, 1]);
    }

    #[tokio::test]
    async fn transcript_records_reference_drained_sequences() {
        let h = harness_with(MockSpeech::new(None));
        for seq in 41..=43 {
            h.processor.ingest(unit(seq, false)).await.unwrap();
        }
        h.processor.flush_tick().await;

        let transcripts = h.store.transcripts_for("s1");
        // Request record plus result record.
        assert_eq!(transcripts.len(), 2);
        assert!(transcripts[0].transcript.is_none());
        let result = &transcripts[1];
        assert_eq!(result.first_sequence, 41);
        assert_eq!(result.last_sequence, 43);
        assert_eq!(result.unit_count, 3);
        assert_eq!(result.transcript.as_deref(), Some("transcribed"));
    }

    #[tokio::test]
    async fn reply_triggers_synthesis_and_broadcast() {
        let h = harness_with(MockSpeech::new(Some("happy to help")));
        h.processor.ingest(unit(0, false)).await.unwrap();
        h.processor.flush_tick().await;

        assert_eq!(h.synth.calls.load(Ordering::SeqCst), 1);
        let frames = h.broadcast.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ServerFrame::AiAudioReply {
                session_id,
                audio_id,
                transcript,
                ..
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(audio_id, "audio-1");
                assert_eq!(transcript, "happy to help");
            }
            other => panic!("Unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_analysis_is_logged_and_not_retried() {
        let h = harness_with(MockSpeech::failing());
        h.processor.ingest(unit(0, false)).await.unwrap();
        h.processor.flush_tick().await;

        // The batch is gone from the live queue and no result record exists;
        // only the request record and the raw media remain.
        assert_eq!(h.processor.queue_len("s1"), 0);
        let transcripts = h.store.transcripts_for("s1");
        assert_eq!(transcripts.len(), 1);
        assert!(transcripts[0].transcript.is_none());
        assert_eq!(h.store.media_for("s1").len(), 1);

        // The next tick makes no further attempt for the lost batch.
        h.processor.flush_tick().await;
        assert_eq!(h.speech.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_session_does_not_block_others() {
        let h = harness_with(MockSpeech::failing());
        h.processor.ingest(unit(0, false)).await.unwrap();
        let mut other = unit(0, false);
        other.session_id = "s2".to_string();
        h.processor.ingest(other).await.unwrap();

        let drained = h.processor.flush_tick().await;
        assert_eq!(drained, 2);
        assert_eq!(h.speech.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn end_stream_disposes_state_after_grace_delay_only() {
        let h = harness_with(MockSpeech::new(None));
        h.processor.ingest(unit(0, false)).await.unwrap();
        h.processor.end_stream("s1").await;

        // Final flush already ran; state survives the grace window.
        assert_eq!(h.speech.call_count(), 1);
        assert!(h.processor.has_state("s1"));

        // Let the disposal task register its sleep before the clock moves.
        tokio::task::yield_now().await;
        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(!h.processor.has_state("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_ingest_cancels_scheduled_disposal() {
        let h = harness_with(MockSpeech::new(None));
        h.processor.ingest(unit(0, false)).await.unwrap();
        h.processor.end_stream("s1").await;
        tokio::task::yield_now().await;

        // A late chunk inside the grace window reactivates the state.
        h.processor.ingest(unit(1, false)).await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(h.processor.has_state("s1"));
    }

    #[tokio::test]
    async fn respond_to_text_broadcasts_ai_reply() {
        let h = harness_with(MockSpeech::new(None));
        h.processor.respond_to_text("s1", "where is my refund?").await;

        let frames = h.broadcast.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ServerFrame::AiTextReply { text, .. } => {
                assert_eq!(text, "re: where is my refund?");
            }
            other => panic!("Unexpected frame: {:?}", other),
        }
        assert_eq!(h.store.texts_for("s1").len(), 1);
    }
}
