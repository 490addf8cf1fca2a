//! # Append-Only Record Store
//!
//! Persistence seam for everything the coordinator durably records: every
//! ingested media unit (written at ingestion time, regardless of what the
//! later analysis does with it), transcripts and video-analysis summaries,
//! session status transitions, and text messages.
//!
//! The store is intentionally availability-over-durability: a write failure is
//! logged and never fails the in-memory pipeline. Units that miss the append
//! log are still served from the live queue for the current flush cycle, they
//! are just not recoverable afterwards.
//!
//! `MemoryStore` is the in-process implementation used by the server and the
//! test suite; a database-backed implementation plugs in behind the same
//! trait.

use crate::stream::MediaKind;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::sync::RwLock;

/// One ingested audio chunk or video frame, as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MediaRecord {
    pub session_id: String,
    pub user_id: String,
    pub kind: MediaKind,
    pub sequence: u64,
    /// `is_final` for audio, `is_key_frame` for video.
    pub marker: bool,
    pub payload_len: usize,
    pub payload: Vec<u8>,
    pub recorded_at: DateTime<Utc>,
}

/// A transcription request or its completed result.
///
/// Two records per flush: one with `transcript: None` written before the
/// speech pipeline is invoked, one with the result after it succeeds. The
/// sequence range ties the analysis back to the drained units.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptRecord {
    pub session_id: String,
    pub unit_count: usize,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub transcript: Option<String>,
    pub reply: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Key-frame analysis result or periodic aggregate for a video session.
#[derive(Debug, Clone, Serialize)]
pub struct VideoSummaryRecord {
    pub session_id: String,
    pub kind: VideoSummaryKind,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSummaryKind {
    KeyFrame,
    Aggregate,
}

/// A chat message relayed through a call session.
#[derive(Debug, Clone, Serialize)]
pub struct TextRecord {
    pub session_id: String,
    pub user_id: String,
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

/// A session status transition, as reported over the wire or decided by the
/// multiplexer.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub session_id: String,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only persistence writes.
///
/// Methods return `BoxFuture` rather than using an async-trait macro so the
/// trait stays object-safe with the crate's existing future tooling.
pub trait RecordStore: Send + Sync {
    fn append_media(&self, record: MediaRecord) -> BoxFuture<'_, Result<(), String>>;
    fn append_transcript(&self, record: TranscriptRecord) -> BoxFuture<'_, Result<(), String>>;
    fn append_video_summary(&self, record: VideoSummaryRecord) -> BoxFuture<'_, Result<(), String>>;
    fn append_text(&self, record: TextRecord) -> BoxFuture<'_, Result<(), String>>;
    fn append_status(&self, record: StatusRecord) -> BoxFuture<'_, Result<(), String>>;
}

/// In-process append-only store.
#[derive(Default)]
pub struct MemoryStore {
    media: RwLock<Vec<MediaRecord>>,
    transcripts: RwLock<Vec<TranscriptRecord>>,
    video_summaries: RwLock<Vec<VideoSummaryRecord>>,
    texts: RwLock<Vec<TextRecord>>,
    statuses: RwLock<Vec<StatusRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All media records for one session, in append order.
    pub fn media_for(&self, session_id: &str) -> Vec<MediaRecord> {
        self.media
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn transcripts_for(&self, session_id: &str) -> Vec<TranscriptRecord> {
        self.transcripts
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn video_summaries_for(&self, session_id: &str) -> Vec<VideoSummaryRecord> {
        self.video_summaries
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn texts_for(&self, session_id: &str) -> Vec<TextRecord> {
        self.texts
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn statuses_for(&self, session_id: &str) -> Vec<StatusRecord> {
        self.statuses
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn media_count(&self) -> usize {
        self.media.read().unwrap().len()
    }

    pub fn transcript_count(&self) -> usize {
        self.transcripts.read().unwrap().len()
    }
}

impl RecordStore for MemoryStore {
    fn append_media(&self, record: MediaRecord) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.media.write().unwrap().push(record);
            Ok(())
        })
    }

    fn append_transcript(&self, record: TranscriptRecord) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.transcripts.write().unwrap().push(record);
            Ok(())
        })
    }

    fn append_video_summary(&self, record: VideoSummaryRecord) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.video_summaries.write().unwrap().push(record);
            Ok(())
        })
    }

    fn append_text(&self, record: TextRecord) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.texts.write().unwrap().push(record);
            Ok(())
        })
    }

    fn append_status(&self, record: StatusRecord) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.statuses.write().unwrap().push(record);
            Ok(())
        })
    }
}
