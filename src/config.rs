//! # Configuration Management
//!
//! Loads application configuration from layered sources, highest priority
//! first:
//! 1. Environment variables (`APP_` prefix, plus bare `HOST`/`PORT` used by
//!    deployment platforms)
//! 2. `config.toml` in the working directory
//! 3. Built-in defaults
//!
//! The streaming section carries the coordinator's tuning knobs: flush
//! periods, grace delays, and queue bounds. The reference flush periods
//! (100 ms audio / 200 ms video) and grace delays (5 s audio / 10 s video)
//! are defaults here, not constants, as is the movement heuristic threshold.
//! These are provider-tuning values rather than architectural ones.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Capacity bounds enforced at the boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum sessions in a non-terminal state at once.
    pub max_concurrent_sessions: usize,
    /// Maximum pending units per session live queue before eviction.
    pub max_queue_len: usize,
}

/// Tuning for the stream processors and the WebSocket heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Audio flush-loop period in milliseconds.
    pub audio_flush_ms: u64,
    /// Video flush-loop period in milliseconds.
    pub video_flush_ms: u64,
    /// Delay before disposing an ended audio StreamState.
    pub audio_grace_secs: u64,
    /// Delay before disposing an ended video StreamState (longer: higher
    /// volume and slower downstream generation).
    pub video_grace_secs: u64,
    /// Minimum units in one video aggregation window to count as movement.
    pub movement_min_units: usize,
    /// WebSocket ping interval.
    pub heartbeat_secs: u64,
    /// Close a connection after this long without client activity.
    pub client_timeout_secs: u64,
}

impl StreamingConfig {
    pub fn audio_flush_interval(&self) -> Duration {
        Duration::from_millis(self.audio_flush_ms)
    }

    pub fn video_flush_interval(&self) -> Duration {
        Duration::from_millis(self.video_flush_ms)
    }

    pub fn audio_grace(&self) -> Duration {
        Duration::from_secs(self.audio_grace_secs)
    }

    pub fn video_grace(&self) -> Duration {
        Duration::from_secs(self.video_grace_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            limits: LimitsConfig {
                max_concurrent_sessions: 50,
                max_queue_len: 256,
            },
            streaming: StreamingConfig {
                audio_flush_ms: 100,
                video_flush_ms: 200,
                audio_grace_secs: 5,
                video_grace_secs: 10,
                movement_min_units: 2,
                heartbeat_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, file, and environment, in that
    /// layering order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject bare HOST/PORT.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.limits.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if self.limits.max_queue_len == 0 {
            return Err(anyhow::anyhow!("Max queue length must be greater than 0"));
        }
        if self.streaming.audio_flush_ms == 0 || self.streaming.video_flush_ms == 0 {
            return Err(anyhow::anyhow!("Flush intervals must be greater than 0"));
        }
        if self.streaming.client_timeout_secs <= self.streaming.heartbeat_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must exceed the heartbeat interval"
            ));
        }
        Ok(())
    }

    /// Apply a partial update from a JSON document. Only fields present in
    /// the document change; the result is re-validated before it takes
    /// effect.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(limits) = partial.get("limits") {
            if let Some(v) = limits.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.limits.max_concurrent_sessions = v as usize;
            }
            if let Some(v) = limits.get("max_queue_len").and_then(|v| v.as_u64()) {
                self.limits.max_queue_len = v as usize;
            }
        }

        if let Some(streaming) = partial.get("streaming") {
            if let Some(v) = streaming.get("audio_flush_ms").and_then(|v| v.as_u64()) {
                self.streaming.audio_flush_ms = v;
            }
            if let Some(v) = streaming.get("video_flush_ms").and_then(|v| v.as_u64()) {
                self.streaming.video_flush_ms = v;
            }
            if let Some(v) = streaming.get("audio_grace_secs").and_then(|v| v.as_u64()) {
                self.streaming.audio_grace_secs = v;
            }
            if let Some(v) = streaming.get("video_grace_secs").and_then(|v| v.as_u64()) {
                self.streaming.video_grace_secs = v;
            }
            if let Some(v) = streaming.get("movement_min_units").and_then(|v| v.as_u64()) {
                self.streaming.movement_min_units = v as usize;
            }
            if let Some(v) = streaming.get("heartbeat_secs").and_then(|v| v.as_u64()) {
                self.streaming.heartbeat_secs = v;
            }
            if let Some(v) = streaming.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.streaming.client_timeout_secs = v;
            }
        }

        self.validate()?;
        Ok(())
    }
}
