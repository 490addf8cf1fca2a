//! Shared application state and runtime metrics.
//!
//! `AppState` is cloned into every actix worker. The registries and
//! processors inside are shared by `Arc`, so every worker and every socket
//! actor operates on the same instances.

use crate::config::AppConfig;
use crate::pipeline::NoopPipelines;
use crate::session::SessionRegistry;
use crate::store::MemoryStore;
use crate::stream::{AudioStreamProcessor, VideoStreamProcessor};
use crate::ws::registry::ConnectionRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub store: Arc<MemoryStore>,
    pub audio: Arc<AudioStreamProcessor>,
    pub video: Arc<VideoStreamProcessor>,
}

impl AppState {
    /// Wire the full processing graph from one configuration snapshot.
    ///
    /// Pipelines default to the no-op implementations; a deployment wanting
    /// real providers swaps them in here.
    pub fn new(config: AppConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(SessionRegistry::new(&config.limits));
        let pipelines = Arc::new(NoopPipelines);

        let audio = Arc::new(AudioStreamProcessor::new(
            store.clone(),
            pipelines.clone(),
            pipelines.clone(),
            connections.clone(),
            config.streaming.clone(),
            config.limits.max_queue_len,
        ));
        let video = Arc::new(VideoStreamProcessor::new(
            store.clone(),
            pipelines.clone(),
            pipelines,
            connections.clone(),
            config.streaming.clone(),
            config.limits.max_queue_len,
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            sessions,
            connections,
            store,
            audio,
            video,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Counters incremented by the middleware and the socket actors.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_connections: u64,
    pub media_units_ingested: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetrics>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetrics {
    pub count: u64,
    pub errors: u64,
}

impl AppMetrics {
    pub fn record_request(&mut self, endpoint: &str, is_error: bool) {
        self.request_count += 1;
        if is_error {
            self.error_count += 1;
        }
        let entry = self.endpoint_metrics.entry(endpoint.to_string()).or_default();
        entry.count += 1;
        if is_error {
            entry.errors += 1;
        }
    }

    pub fn connection_opened(&mut self) {
        self.active_connections += 1;
    }

    pub fn connection_closed(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_tracks_per_endpoint_counts() {
        let mut metrics = AppMetrics::default();
        metrics.record_request("/api/v1/sessions", false);
        metrics.record_request("/api/v1/sessions", true);
        metrics.record_request("/health", false);

        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 1);
        let sessions = &metrics.endpoint_metrics["/api/v1/sessions"];
        assert_eq!(sessions.count, 2);
        assert_eq!(sessions.errors, 1);
    }

    #[test]
    fn connection_counter_never_underflows() {
        let mut metrics = AppMetrics::default();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections, 0);
        metrics.connection_opened();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections, 0);
    }

    #[test]
    fn state_shares_one_registry_set() {
        let state = AppState::new(AppConfig::default());
        let clone = state.clone();
        clone.sessions.create(None, crate::session::CallType::Voice, None).unwrap();
        assert_eq!(state.sessions.len(), 1);
    }
}
