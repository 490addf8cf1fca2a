//! # Stream Processing Module
//!
//! Converts live audio/video streams into buffered, periodically-flushed
//! batches for the downstream AI pipelines, and routes the synthesized
//! results back out through the connection multiplexer.
//!
//! ## Key Components:
//! - **Media model**: `MediaUnit` / `StreamState` shared by both processors
//! - **Audio processor**: per-session queues flushed to speech analysis
//! - **Video processor**: key-frame fast path plus periodic aggregation
//!
//! Each processor exclusively owns its `session -> StreamState` map. The
//! multiplexer never reaches into these queues; cross-component effects flow
//! only through the record store and explicit broadcasts.

pub mod audio;
pub mod media;
pub mod video;

pub use audio::AudioStreamProcessor;
pub use media::{MediaKind, MediaUnit, StreamState};
pub use video::VideoStreamProcessor;
