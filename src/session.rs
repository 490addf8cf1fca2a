//! # Session Registry
//!
//! Durable record of each call's identity and lifecycle. Every other component
//! reads and writes session state exclusively through this registry, which owns
//! the `session_id -> CallSession` map and enforces the status state machine:
//!
//! ```text
//! initiated -> connecting -> active
//!          \________\__________\____-> ended | failed   (from any live state)
//! ```
//!
//! `ended` and `failed` are terminal. A terminal session may still receive late
//! flush writes through the persistence layer, but it accepts no new
//! connections.

use crate::config::LimitsConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// The media modality of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
    /// Diagnostic calls used by integration checks; routed like voice.
    Test,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
            CallType::Test => "test",
        }
    }
}

impl std::str::FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" => Ok(CallType::Voice),
            "video" => Ok(CallType::Video),
            "test" => Ok(CallType::Test),
            other => Err(format!("Unknown call type: {}", other)),
        }
    }
}

/// Lifecycle status of a session. Transitions are monotonic; see module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initiated,
    Connecting,
    Active,
    Ended,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initiated => "initiated",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Failed)
    }

    /// Rank used to enforce monotonic forward-only transitions.
    fn rank(&self) -> u8 {
        match self {
            SessionStatus::Initiated => 0,
            SessionStatus::Connecting => 1,
            SessionStatus::Active => 2,
            SessionStatus::Ended => 3,
            SessionStatus::Failed => 3,
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Either terminal state is reachable from any live state: a session
    /// whose only participant drops while still `connecting` ends right
    /// there. Re-asserting the current status is accepted as a no-op so
    /// repeated `call_status` messages from clients are harmless.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        next.rank() == self.rank() + 1
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(SessionStatus::Initiated),
            "connecting" => Ok(SessionStatus::Connecting),
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(format!("Unknown session status: {}", other)),
        }
    }
}

/// One ongoing (or finished) call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub session_id: String,
    pub call_type: CallType,
    pub status: SessionStatus,
    /// Downstream AI provider identifier, when one was selected at initiation.
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    fn new(session_id: String, call_type: CallType, provider: Option<String>) -> Self {
        Self {
            session_id,
            call_type,
            status: SessionStatus::Initiated,
            provider,
            created_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Owned registry of active and recently-ended sessions.
///
/// ## Ownership:
/// All mutation funnels through these methods; no other component touches the
/// map. The registry is shared by handle (`Arc<SessionRegistry>`), never as
/// ambient global state.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, CallSession>>,
    max_concurrent_sessions: usize,
}

impl SessionRegistry {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions: limits.max_concurrent_sessions,
        }
    }

    /// Create a session record. A missing `session_id` gets a generated UUID.
    ///
    /// Fails when the id is already taken or the concurrent-session limit is
    /// reached.
    pub fn create(
        &self,
        session_id: Option<String>,
        call_type: CallType,
        provider: Option<String>,
    ) -> Result<CallSession, String> {
        let mut sessions = self.sessions.write().unwrap();

        let live = sessions.values().filter(|s| !s.status.is_terminal()).count();
        if live >= self.max_concurrent_sessions {
            return Err(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_concurrent_sessions
            ));
        }

        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if sessions.contains_key(&session_id) {
            return Err(format!("Session '{}' already exists", session_id));
        }

        let session = CallSession::new(session_id.clone(), call_type, provider);
        sessions.insert(session_id, session.clone());
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<CallSession> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Apply a status transition through the state machine.
    ///
    /// Rejects transitions out of terminal states and any backward move.
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<CallSession, String> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| format!("Session '{}' not found", session_id))?;

        if !session.status.can_transition_to(status) {
            return Err(format!(
                "Illegal status transition for session '{}': {} -> {}",
                session_id,
                session.status.as_str(),
                status.as_str()
            ));
        }

        session.status = status;
        if status.is_terminal() && session.ended_at.is_none() {
            session.ended_at = Some(Utc::now());
        }
        Ok(session.clone())
    }

    /// Move a freshly-initiated session toward `active` when a participant
    /// connects. Called by the multiplexer on every successful connect; the
    /// first connect lands on `connecting`, subsequent ones on `active`.
    pub fn mark_connected(&self, session_id: &str) -> Result<CallSession, String> {
        let current = self
            .get(session_id)
            .ok_or_else(|| format!("Session '{}' not found", session_id))?;

        match current.status {
            SessionStatus::Initiated => self.set_status(session_id, SessionStatus::Connecting),
            SessionStatus::Connecting => self.set_status(session_id, SessionStatus::Active),
            SessionStatus::Active => Ok(current),
            _ => Err(format!(
                "Session '{}' is {} and accepts no new connections",
                session_id,
                current.status.as_str()
            )),
        }
    }

    /// Mark a session ended. Called when its last connection goes away.
    pub fn end(&self, session_id: &str) -> Result<CallSession, String> {
        self.set_status(session_id, SessionStatus::Ended)
    }

    /// Mark a session failed after an irrecoverable transport error.
    pub fn fail(&self, session_id: &str) -> Result<CallSession, String> {
        self.set_status(session_id, SessionStatus::Failed)
    }

    /// Drop a session record entirely (registry-entry release after end).
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().unwrap().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Count of sessions not yet in a terminal state.
    pub fn live_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| !s.status.is_terminal())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(&LimitsConfig {
            max_concurrent_sessions: 4,
            max_queue_len: 256,
        })
    }

    #[test]
    fn create_generates_id_when_missing() {
        let reg = registry();
        let session = reg.create(None, CallType::Voice, None).unwrap();
        assert!(!session.session_id.is_empty());
        assert_eq!(session.status, SessionStatus::Initiated);
        assert!(reg.get(&session.session_id).is_some());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let reg = registry();
        reg.create(Some("s1".into()), CallType::Voice, None).unwrap();
        assert!(reg.create(Some("s1".into()), CallType::Video, None).is_err());
    }

    #[test]
    fn session_limit_counts_only_live_sessions() {
        let reg = registry();
        for i in 0..4 {
            reg.create(Some(format!("s{}", i)), CallType::Voice, None).unwrap();
        }
        assert!(reg.create(Some("s5".into()), CallType::Voice, None).is_err());

        // Ending a session frees a slot.
        reg.mark_connected("s0").unwrap();
        reg.end("s0").unwrap();
        assert!(reg.create(Some("s5".into()), CallType::Voice, None).is_ok());
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let reg = registry();
        reg.create(Some("s1".into()), CallType::Voice, None).unwrap();

        assert!(reg.set_status("s1", SessionStatus::Connecting).is_ok());
        assert!(reg.set_status("s1", SessionStatus::Active).is_ok());
        // Backward move is illegal.
        assert!(reg.set_status("s1", SessionStatus::Connecting).is_err());
        // Re-asserting the current status is a tolerated no-op.
        assert!(reg.set_status("s1", SessionStatus::Active).is_ok());

        assert!(reg.set_status("s1", SessionStatus::Ended).is_ok());
        // Terminal states accept nothing further.
        assert!(reg.set_status("s1", SessionStatus::Active).is_err());
        assert!(reg.set_status("s1", SessionStatus::Failed).is_err());
    }

    #[test]
    fn ended_is_reachable_from_any_live_state() {
        // A sole participant can drop before the session ever goes active;
        // the session still has to end.
        let reg = registry();
        reg.create(Some("a".into()), CallType::Voice, None).unwrap();
        assert!(reg.end("a").is_ok());
        assert_eq!(reg.get("a").unwrap().status, SessionStatus::Ended);

        reg.create(Some("b".into()), CallType::Voice, None).unwrap();
        reg.mark_connected("b").unwrap();
        assert_eq!(reg.get("b").unwrap().status, SessionStatus::Connecting);
        assert!(reg.end("b").is_ok());
        assert!(reg.get("b").unwrap().ended_at.is_some());
    }

    #[test]
    fn failed_is_reachable_from_any_live_state() {
        let reg = registry();
        reg.create(Some("a".into()), CallType::Voice, None).unwrap();
        assert!(reg.fail("a").is_ok());

        reg.create(Some("b".into()), CallType::Voice, None).unwrap();
        reg.mark_connected("b").unwrap();
        reg.mark_connected("b").unwrap();
        assert_eq!(reg.get("b").unwrap().status, SessionStatus::Active);
        assert!(reg.fail("b").is_ok());
    }

    #[test]
    fn mark_connected_walks_toward_active() {
        let reg = registry();
        reg.create(Some("s1".into()), CallType::Video, None).unwrap();
        assert_eq!(reg.mark_connected("s1").unwrap().status, SessionStatus::Connecting);
        assert_eq!(reg.mark_connected("s1").unwrap().status, SessionStatus::Active);
        // Already active: further connects leave the status alone.
        assert_eq!(reg.mark_connected("s1").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn terminal_sessions_refuse_connections() {
        let reg = registry();
        reg.create(Some("s1".into()), CallType::Voice, None).unwrap();
        reg.mark_connected("s1").unwrap();
        reg.end("s1").unwrap();
        assert!(reg.mark_connected("s1").is_err());
        assert!(reg.get("s1").unwrap().ended_at.is_some());
    }
}
