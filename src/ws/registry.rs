//! Connection registry: the multiplexer's fan-out table.
//!
//! Owns the `session -> connections` map. Connections exist only here and
//! only for the lifetime of their socket; nothing about them is persisted.
//! All broadcasts in the system, peer relay and AI replies alike, go through
//! [`ConnectionRegistry::broadcast_text`], which reports an explicit
//! per-connection delivery outcome instead of relying on transport side
//! effects.

use crate::session::CallType;
use crate::ws::frames::ServerFrame;
use actix::prelude::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// One serialized JSON frame bound for a socket actor's mailbox.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct OutboundFrame(pub String);

/// A participant's live channel into a session.
pub struct ConnectionEntry {
    pub connection_id: String,
    pub session_id: String,
    pub user_id: String,
    pub call_type: CallType,
    pub recipient: Recipient<OutboundFrame>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Introspection view of a connection (no transport handle).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub user_id: String,
    pub call_type: CallType,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Outcome of delivering one broadcast frame to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// Mailbox full; frame dropped for this connection only.
    Skipped,
    /// Recipient already gone; unregistration will follow shortly.
    Errored,
}

#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub connection_id: String,
    pub outcome: DeliveryOutcome,
}

/// Fan-out seam used by the stream processors.
///
/// Broadcasting into a session with no open connections is a no-op, not an
/// error.
pub trait SessionBroadcast: Send + Sync {
    fn broadcast(&self, session_id: &str, frame: &ServerFrame) -> Vec<Delivery>;
}

/// Owned registry of live connections, keyed by session.
///
/// Exclusively owned by the multiplexer; the stream processors only reach it
/// through the [`SessionBroadcast`] trait.
pub struct ConnectionRegistry {
    /// session_id -> connection_id -> entry
    sessions: RwLock<HashMap<String, HashMap<String, ConnectionEntry>>>,
    /// connection_id -> session_id reverse index
    index: RwLock<HashMap<String, String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection under its session and return the entry count
    /// for that session after insertion.
    pub fn register(
        &self,
        connection_id: &str,
        session_id: &str,
        user_id: &str,
        call_type: CallType,
        recipient: Recipient<OutboundFrame>,
    ) -> usize {
        let now = Utc::now();
        let entry = ConnectionEntry {
            connection_id: connection_id.to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            call_type,
            recipient,
            connected_at: now,
            last_activity: now,
        };

        // The sessions guard is released before the index lock is taken;
        // `touch` nests index -> sessions, so holding both here would invert
        // the lock order.
        let count = {
            let mut sessions = self.sessions.write().unwrap();
            let set = sessions.entry(session_id.to_string()).or_default();
            set.insert(connection_id.to_string(), entry);
            set.len()
        };
        self.index
            .write()
            .unwrap()
            .insert(connection_id.to_string(), session_id.to_string());
        count
    }

    /// Remove a connection. Returns `Some((session_id, session_now_empty))`
    /// when the connection was known; an emptied session's map entry is
    /// released here.
    pub fn unregister(&self, connection_id: &str) -> Option<(String, bool)> {
        let session_id = self.index.write().unwrap().remove(connection_id)?;
        let mut sessions = self.sessions.write().unwrap();
        let emptied = if let Some(set) = sessions.get_mut(&session_id) {
            set.remove(connection_id);
            set.is_empty()
        } else {
            false
        };
        if emptied {
            sessions.remove(&session_id);
        }
        Some((session_id, emptied))
    }

    /// Bump a connection's last-activity timestamp.
    pub fn touch(&self, connection_id: &str) {
        let index = self.index.read().unwrap();
        if let Some(session_id) = index.get(connection_id) {
            let mut sessions = self.sessions.write().unwrap();
            if let Some(entry) = sessions
                .get_mut(session_id)
                .and_then(|set| set.get_mut(connection_id))
            {
                entry.last_activity = Utc::now();
            }
        }
    }

    /// Deliver one serialized frame to every open connection of a session,
    /// optionally excluding the sender (peer relay). Unwritable channels are
    /// skipped, never fatal; the caller gets the full per-connection outcome.
    ///
    /// Within one session, frames are handed to each mailbox in the order
    /// this method is called, which preserves dispatch order end to end.
    pub fn broadcast_text(
        &self,
        session_id: &str,
        text: &str,
        exclude: Option<&str>,
    ) -> Vec<Delivery> {
        let sessions = self.sessions.read().unwrap();
        let Some(set) = sessions.get(session_id) else {
            return Vec::new();
        };

        let mut deliveries = Vec::with_capacity(set.len());
        for (connection_id, entry) in set.iter() {
            if exclude == Some(connection_id.as_str()) {
                continue;
            }
            let outcome = match entry.recipient.try_send(OutboundFrame(text.to_string())) {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(SendError::Full(_)) => {
                    tracing::warn!(
                        session_id = %session_id,
                        connection_id = %connection_id,
                        "Mailbox full, skipping broadcast delivery"
                    );
                    DeliveryOutcome::Skipped
                }
                Err(SendError::Closed(_)) => DeliveryOutcome::Errored,
            };
            deliveries.push(Delivery {
                connection_id: connection_id.clone(),
                outcome,
            });
        }
        deliveries
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.sessions.read().unwrap().values().map(|set| set.len()).sum()
    }

    /// Introspection view of a session's open connections.
    pub fn session_connections(&self, session_id: &str) -> Vec<ConnectionInfo> {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)
            .map(|set| {
                set.values()
                    .map(|entry| ConnectionInfo {
                        id: entry.connection_id.clone(),
                        user_id: entry.user_id.clone(),
                        call_type: entry.call_type,
                        connected_at: entry.connected_at,
                        last_activity: entry.last_activity,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBroadcast for ConnectionRegistry {
    fn broadcast(&self, session_id: &str, frame: &ServerFrame) -> Vec<Delivery> {
        self.broadcast_text(session_id, &frame.to_json(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::frames::now_millis;
    use std::sync::{Arc, Mutex};

    /// Test double standing in for a socket actor: records every frame it is
    /// handed.
    struct Collector {
        received: Arc<Mutex<Vec<String>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<OutboundFrame> for Collector {
        type Result = ();

        fn handle(&mut self, msg: OutboundFrame, _ctx: &mut Self::Context) {
            self.received.lock().unwrap().push(msg.0);
        }
    }

    fn spawn_collector() -> (Recipient<OutboundFrame>, Arc<Mutex<Vec<String>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector {
            received: received.clone(),
        }
        .start();
        (addr.recipient(), received)
    }

    async fn drain_mailboxes() {
        // Let collector actors process their queued frames.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    #[actix_rt::test]
    async fn peer_relay_excludes_the_sender() {
        let registry = ConnectionRegistry::new();
        let (r1, got1) = spawn_collector();
        let (r2, got2) = spawn_collector();
        registry.register("c1", "s1", "alice", CallType::Voice, r1);
        registry.register("c2", "s1", "bob", CallType::Voice, r2);

        let deliveries = registry.broadcast_text("s1", "relayed", Some("c1"));
        drain_mailboxes().await;

        // N = 2 connections: exactly N - 1 deliveries for peer relay.
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].connection_id, "c2");
        assert_eq!(deliveries[0].outcome, DeliveryOutcome::Delivered);
        assert!(got1.lock().unwrap().is_empty());
        assert_eq!(got2.lock().unwrap().as_slice(), ["relayed".to_string()]);
    }

    #[actix_rt::test]
    async fn echo_broadcast_reaches_all_connections() {
        let registry = ConnectionRegistry::new();
        let (r1, got1) = spawn_collector();
        let (r2, got2) = spawn_collector();
        registry.register("c1", "s1", "alice", CallType::Voice, r1);
        registry.register("c2", "s1", "bob", CallType::Voice, r2);

        let deliveries = registry.broadcast_text("s1", "text", None);
        drain_mailboxes().await;

        assert_eq!(deliveries.len(), 2);
        assert_eq!(got1.lock().unwrap().len(), 1);
        assert_eq!(got2.lock().unwrap().len(), 1);
    }

    #[actix_rt::test]
    async fn broadcast_is_scoped_to_one_session() {
        let registry = ConnectionRegistry::new();
        let (r1, _got1) = spawn_collector();
        let (r2, got2) = spawn_collector();
        registry.register("c1", "s1", "alice", CallType::Voice, r1);
        registry.register("c2", "s2", "carol", CallType::Voice, r2);

        let deliveries = registry.broadcast_text("s1", "scoped", None);
        drain_mailboxes().await;

        assert_eq!(deliveries.len(), 1);
        assert!(got2.lock().unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn broadcast_to_empty_session_is_a_noop() {
        let registry = ConnectionRegistry::new();
        let deliveries = registry.broadcast_text("missing", "anything", None);
        assert!(deliveries.is_empty());
    }

    #[actix_rt::test]
    async fn unregister_reports_when_a_session_empties() {
        let registry = ConnectionRegistry::new();
        let (r1, _g1) = spawn_collector();
        let (r2, _g2) = spawn_collector();
        registry.register("c1", "s1", "alice", CallType::Voice, r1);
        registry.register("c2", "s1", "bob", CallType::Voice, r2);
        assert_eq!(registry.connection_count("s1"), 2);

        assert_eq!(registry.unregister("c1"), Some(("s1".to_string(), false)));
        assert_eq!(registry.connection_count("s1"), 1);
        assert_eq!(registry.unregister("c2"), Some(("s1".to_string(), true)));
        assert_eq!(registry.connection_count("s1"), 0);

        // Unknown connection ids are ignored.
        assert_eq!(registry.unregister("c1"), None);
    }

    #[actix_rt::test]
    async fn concurrent_register_and_touch_make_progress() {
        // register and touch race from different worker threads in
        // production; they must never hold the two registry locks in
        // opposite orders.
        let registry = Arc::new(ConnectionRegistry::new());
        let (recipient, _got) = spawn_collector();
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let reg = registry.clone();
        let gate = barrier.clone();
        let rec = recipient.clone();
        let registrar = std::thread::spawn(move || {
            gate.wait();
            for i in 0..2000 {
                reg.register(&format!("c{}", i % 8), "s1", "alice", CallType::Voice, rec.clone());
            }
        });

        let reg = registry.clone();
        let gate = barrier.clone();
        let toucher = std::thread::spawn(move || {
            gate.wait();
            for i in 0..2000 {
                reg.touch(&format!("c{}", i % 8));
            }
        });

        registrar.join().unwrap();
        toucher.join().unwrap();
        assert_eq!(registry.connection_count("s1"), 8);
    }

    #[actix_rt::test]
    async fn session_broadcast_trait_serializes_frames() {
        let registry = ConnectionRegistry::new();
        let (r1, got1) = spawn_collector();
        registry.register("c1", "s1", "alice", CallType::Voice, r1);

        let frame = ServerFrame::AiAudioReply {
            session_id: "s1".into(),
            audio_id: "a-1".into(),
            transcript: "hello".into(),
            duration_ms: 900,
            timestamp: now_millis(),
        };
        let deliveries = SessionBroadcast::broadcast(&registry, "s1", &frame);
        drain_mailboxes().await;

        assert_eq!(deliveries.len(), 1);
        let received = got1.lock().unwrap();
        assert!(received[0].contains(r#""type":"ai_audio_reply""#));
        assert!(received[0].contains(r#""audio_id":"a-1""#));
    }
}
