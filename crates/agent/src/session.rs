//! Session registry: one isolated event log and cancellation token per run.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ironloop_core::error::SessionError;
use ironloop_core::event::EventStream;
use ironloop_core::runtime::RuntimeConfig;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Aborted)
                | (Created, Failed)
                | (Running, Completed)
                | (Running, Aborted)
                | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Session {
    id: String,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Wall-clock time of the last change, used for expiry.
    last_active: DateTime<Utc>,
    events: Arc<EventStream>,
    cancel: CancellationToken,
}

impl Session {
    fn new(id: String, events: Arc<EventStream>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
            last_active: Utc::now(),
            events,
            cancel: CancellationToken::new(),
        }
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            event_count: self.events.len(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, ttl_secs: i64) -> bool {
        self.status.is_terminal() && (now - self.last_active).num_seconds() >= ttl_secs
    }
}

/// What a running loop needs from its session.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub events: Arc<EventStream>,
    pub cancel: CancellationToken,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("events", &self.events.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub event_count: usize,
}

pub struct SessionManager {
    sessions: DashMap<String, Session>,
    runtime: RuntimeConfig,
    ttl_secs: i64,
}

impl SessionManager {
    pub fn new(runtime: RuntimeConfig, ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            runtime,
            ttl_secs: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
        }
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Open a session for a new run.
    ///
    /// A terminal session with the same id is replaced by a fresh one that
    /// keeps its event log, so the conversation continues. A session that is
    /// still live is `AlreadyRunning`.
    #[instrument(skip(self))]
    pub fn start(&self, session_id: Option<&str>) -> Result<SessionHandle, SessionError> {
        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = self.runtime.now();

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if !existing.status.is_terminal() {
                    return Err(SessionError::AlreadyRunning(id));
                }
                let events = existing.events.clone();
                *existing = Session::new(id.clone(), events, now);
                debug!(session_id = %id, "session continued");
                Ok(existing.handle())
            }
            Entry::Vacant(entry) => {
                let events = Arc::new(EventStream::with_runtime(self.runtime.clone()));
                let session = Session::new(id.clone(), events, now);
                let handle = session.handle();
                entry.insert(session);
                debug!(session_id = %id, "session created");
                Ok(handle)
            }
        }
    }

    /// Move a session to `next`. Finishing an aborted session keeps it aborted.
    pub fn transition(&self, session_id: &str, next: SessionStatus) -> Result<SessionStatus, SessionError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if session.status == SessionStatus::Aborted && next.is_terminal() {
            return Ok(SessionStatus::Aborted);
        }
        if !session.status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                session_id: session_id.to_string(),
                from: session.status.to_string(),
                to: next.to_string(),
            });
        }

        debug!(session_id, from = %session.status, to = %next, "session transition");
        session.status = next;
        session.updated_at = self.runtime.now();
        session.last_active = Utc::now();
        Ok(next)
    }

    /// Signal cancellation to a running session. `false` if it is not running.
    #[instrument(skip(self))]
    pub fn abort(&self, session_id: &str) -> bool {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if session.status != SessionStatus::Running {
            return false;
        }
        session.status = SessionStatus::Aborted;
        session.updated_at = self.runtime.now();
        session.last_active = Utc::now();
        session.cancel.cancel();
        debug!(session_id, "session aborted");
        true
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|s| s.info())
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.get(session_id).map(|s| s.status)
    }

    pub fn events(&self, session_id: &str) -> Option<Arc<EventStream>> {
        self.sessions.get(session_id).map(|s| s.events.clone())
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.iter().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Remove a session, cancelling it if still live.
    pub fn dispose(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, session)) => {
                session.cancel.cancel();
                debug!(session_id, "session disposed");
                true
            }
            None => false,
        }
    }

    /// Sessions that are created or running.
    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| !s.status.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop terminal sessions idle for at least the TTL. Returns how many.
    ///
    /// `now` is wall-clock time; a fixed runtime clock only stamps events.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl_secs;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(now, ttl))
            .map(|s| s.key().clone())
            .collect();

        expired
            .iter()
            .filter(|id| {
                self.sessions
                    .remove_if(id.as_str(), |_, s| s.is_expired(now, ttl))
                    .is_some()
            })
            .count()
    }

    /// Periodic cleanup until the manager is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let removed = manager.cleanup_expired(Utc::now());
                if removed > 0 {
                    debug!(removed, "Cleaned up expired sessions");
                }
            }
        })
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(RuntimeConfig::default(), Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironloop_core::event::EventKind;

    #[test]
    fn generated_ids_are_unique() {
        let manager = SessionManager::default();
        let a = manager.start(None).unwrap();
        let b = manager.start(None).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(manager.status(&a.id), Some(SessionStatus::Created));
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn live_session_cannot_be_started_twice() {
        let manager = SessionManager::default();
        manager.start(Some("s1")).unwrap();
        manager.transition("s1", SessionStatus::Running).unwrap();
        let err = manager.start(Some("s1")).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRunning(id) if id == "s1"));
    }

    #[test]
    fn terminal_session_continues_with_same_log() {
        let manager = SessionManager::default();
        let first = manager.start(Some("s1")).unwrap();
        first.events.append(EventKind::user("hello"));
        manager.transition("s1", SessionStatus::Running).unwrap();
        manager.transition("s1", SessionStatus::Completed).unwrap();

        let second = manager.start(Some("s1")).unwrap();
        assert!(Arc::ptr_eq(&first.events, &second.events));
        assert_eq!(second.events.len(), 1);
        assert_eq!(manager.status("s1"), Some(SessionStatus::Created));
        assert!(!second.cancel.is_cancelled());
    }

    #[test]
    fn abort_only_running_sessions() {
        let manager = SessionManager::default();
        assert!(!manager.abort("missing"));

        let handle = manager.start(Some("s1")).unwrap();
        assert!(!manager.abort("s1"));

        manager.transition("s1", SessionStatus::Running).unwrap();
        assert!(manager.abort("s1"));
        assert!(handle.cancel.is_cancelled());
        assert_eq!(manager.status("s1"), Some(SessionStatus::Aborted));
        assert!(!manager.abort("s1"));
    }

    #[test]
    fn finishing_aborted_session_keeps_it_aborted() {
        let manager = SessionManager::default();
        manager.start(Some("s1")).unwrap();
        manager.transition("s1", SessionStatus::Running).unwrap();
        manager.abort("s1");
        assert_eq!(
            manager.transition("s1", SessionStatus::Completed).unwrap(),
            SessionStatus::Aborted
        );
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let manager = SessionManager::default();
        manager.start(Some("s1")).unwrap();
        manager.transition("s1", SessionStatus::Running).unwrap();
        manager.transition("s1", SessionStatus::Completed).unwrap();

        let err = manager.transition("s1", SessionStatus::Running).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition { ref from, ref to, .. } if from == "completed" && to == "running"
        ));
        assert!(matches!(
            manager.transition("missing", SessionStatus::Running),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn cleanup_removes_only_expired_terminal_sessions() {
        let manager = SessionManager::new(RuntimeConfig::default(), Duration::from_secs(60));
        manager.start(Some("done")).unwrap();
        manager.transition("done", SessionStatus::Failed).unwrap();
        manager.start(Some("live")).unwrap();

        let now = Utc::now();
        assert_eq!(manager.cleanup_expired(now), 0);
        assert_eq!(manager.cleanup_expired(now + chrono::Duration::seconds(61)), 1);
        assert!(manager.get("done").is_none());
        assert!(manager.get("live").is_some());
    }

    #[test]
    fn fixed_clock_does_not_block_expiry() {
        let at = chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let manager = SessionManager::new(RuntimeConfig::deterministic(at), Duration::from_secs(60));
        manager.start(Some("done")).unwrap();
        manager.transition("done", SessionStatus::Running).unwrap();
        manager.transition("done", SessionStatus::Completed).unwrap();
        assert_eq!(manager.get("done").unwrap().updated_at, at);

        assert_eq!(manager.cleanup_expired(Utc::now()), 0);
        assert_eq!(manager.cleanup_expired(Utc::now() + chrono::Duration::seconds(61)), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn dispose_cancels_and_removes() {
        let manager = SessionManager::default();
        let handle = manager.start(Some("s1")).unwrap();
        assert!(manager.dispose("s1"));
        assert!(handle.cancel.is_cancelled());
        assert!(manager.is_empty());
        assert!(!manager.dispose("s1"));
    }

    #[test]
    fn list_is_ordered() {
        let at = chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let manager = SessionManager::new(RuntimeConfig::deterministic(at), Duration::from_secs(60));
        manager.start(Some("b")).unwrap();
        manager.start(Some("a")).unwrap();
        let ids: Vec<String> = manager.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn background_cleanup_runs_on_interval() {
        let manager = Arc::new(SessionManager::new(RuntimeConfig::default(), Duration::ZERO));
        manager.start(Some("s1")).unwrap();
        manager.transition("s1", SessionStatus::Failed).unwrap();

        let task = manager.spawn_cleanup(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert!(manager.is_empty());
        task.abort();
    }
}
