use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use recordguard_core::{RecordScope, UserId};

/// What a session holder is doing with the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    Viewing,
    Editing,
}

impl SessionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionAction::Viewing => "viewing",
            SessionAction::Editing => "editing",
        }
    }
}

/// One user's presence on one record.
///
/// Keyed uniquely by `(user_id, scope)`: starting a new session for the same
/// key replaces the prior one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub scope: RecordScope,
    pub action: SessionAction,
    pub started_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
}

impl Session {
    fn new(scope: RecordScope, user_id: UserId, action: SessionAction) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            scope,
            action,
            started_at: now,
            last_ping: now,
        }
    }

    pub fn is_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_ping) > ttl
    }
}

/// In-process presence registry with TTL.
///
/// Presence is advisory: every operation degrades to a logged no-op on an
/// internal failure (lock poisoning) instead of surfacing an error, so the
/// save path is never blocked by the session layer.
#[derive(Debug)]
pub struct SessionTracker {
    ttl: chrono::Duration,
    sessions: RwLock<HashMap<RecordScope, Vec<Session>>>,
}

impl SessionTracker {
    /// Default inactivity TTL: 5 minutes.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc(ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(ttl))
    }

    /// Register presence, replacing any prior session for the same
    /// `(user, scope)` key.
    pub fn start(&self, scope: RecordScope, user_id: UserId, action: SessionAction) -> Session {
        let session = Session::new(scope.clone(), user_id, action);

        match self.sessions.write() {
            Ok(mut sessions) => {
                let entries = sessions.entry(scope).or_default();
                entries.retain(|s| s.user_id != user_id);
                entries.push(session.clone());
            }
            Err(_) => {
                warn!(scope = %session.scope, user = %user_id, "session registry poisoned, presence lost");
            }
        }

        session
    }

    /// Refresh `last_ping` only. Returns whether a session was found.
    pub fn heartbeat(&self, scope: &RecordScope, user_id: UserId) -> bool {
        match self.sessions.write() {
            Ok(mut sessions) => {
                if let Some(session) = sessions
                    .get_mut(scope)
                    .and_then(|entries| entries.iter_mut().find(|s| s.user_id == user_id))
                {
                    session.last_ping = Utc::now();
                    return true;
                }
                false
            }
            Err(_) => {
                warn!(scope = %scope, user = %user_id, "session registry poisoned, heartbeat dropped");
                false
            }
        }
    }

    /// Remove a session, returning it if present. Idempotent.
    pub fn end(&self, scope: &RecordScope, user_id: UserId) -> Option<Session> {
        match self.sessions.write() {
            Ok(mut sessions) => {
                let entries = sessions.get_mut(scope)?;
                let idx = entries.iter().position(|s| s.user_id == user_id)?;
                let removed = entries.remove(idx);
                if entries.is_empty() {
                    sessions.remove(scope);
                }
                Some(removed)
            }
            Err(_) => {
                warn!(scope = %scope, user = %user_id, "session registry poisoned, end dropped");
                None
            }
        }
    }

    /// Non-expired sessions for the record, most recently started first.
    ///
    /// Expiry is evaluated lazily at call time; the periodic reaper removes
    /// the entries for good.
    pub fn active(&self, scope: &RecordScope) -> Vec<Session> {
        let now = Utc::now();
        match self.sessions.read() {
            Ok(sessions) => {
                let mut live: Vec<Session> = sessions
                    .get(scope)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|s| !s.is_expired(self.ttl, now))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                live.sort_by(|a, b| b.started_at.cmp(&a.started_at));
                live
            }
            Err(_) => {
                warn!(scope = %scope, "session registry poisoned, presence unknown");
                Vec::new()
            }
        }
    }

    /// Remove every expired session, returning the evicted entries.
    ///
    /// One anomalous entry (e.g. a `last_ping` in the future, which a clock
    /// jump can produce) is logged and skipped without aborting the pass for
    /// the remaining records.
    pub fn evict_expired(&self) -> Vec<Session> {
        let now = Utc::now();
        let mut evicted = Vec::new();

        let Ok(mut sessions) = self.sessions.write() else {
            warn!("session registry poisoned, eviction pass skipped");
            return evicted;
        };

        sessions.retain(|scope, entries| {
            entries.retain(|session| {
                if session.last_ping > now + self.ttl {
                    warn!(
                        scope = %scope,
                        user = %session.user_id,
                        last_ping = %session.last_ping,
                        "session pinged from the future, skipping"
                    );
                    return true;
                }
                if session.is_expired(self.ttl, now) {
                    evicted.push(session.clone());
                    return false;
                }
                true
            });
            !entries.is_empty()
        });

        evicted
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .map(|sessions| sessions.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordguard_core::RecordId;

    fn scope() -> RecordScope {
        RecordScope::new("orders", RecordId::new())
    }

    #[test]
    fn restart_replaces_prior_session_for_same_user() {
        let tracker = SessionTracker::new(SessionTracker::DEFAULT_TTL);
        let scope = scope();
        let user = UserId::new();

        tracker.start(scope.clone(), user, SessionAction::Viewing);
        tracker.start(scope.clone(), user, SessionAction::Editing);

        let active = tracker.active(&scope);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].action, SessionAction::Editing);
    }

    #[test]
    fn active_is_most_recently_started_first() {
        let tracker = SessionTracker::new(SessionTracker::DEFAULT_TTL);
        let scope = scope();
        let first = UserId::new();
        let second = UserId::new();

        tracker.start(scope.clone(), first, SessionAction::Viewing);
        std::thread::sleep(std::time::Duration::from_millis(5));
        tracker.start(scope.clone(), second, SessionAction::Editing);

        let active = tracker.active(&scope);
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].user_id, second);
        assert_eq!(active[1].user_id, first);
    }

    #[test]
    fn end_is_idempotent() {
        let tracker = SessionTracker::new(SessionTracker::DEFAULT_TTL);
        let scope = scope();
        let user = UserId::new();

        tracker.start(scope.clone(), user, SessionAction::Editing);
        assert!(tracker.end(&scope, user).is_some());
        assert!(tracker.end(&scope, user).is_none());
        assert_eq!(tracker.session_count(), 0);
    }

    #[test]
    fn expired_sessions_are_invisible_and_evictable() {
        let tracker = SessionTracker::new(Duration::from_millis(10));
        let scope = scope();
        let user = UserId::new();

        tracker.start(scope.clone(), user, SessionAction::Editing);
        std::thread::sleep(Duration::from_millis(30));

        assert!(tracker.active(&scope).is_empty());

        let evicted = tracker.evict_expired();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].user_id, user);
        assert_eq!(tracker.session_count(), 0);
    }

    #[test]
    fn heartbeat_keeps_a_session_alive() {
        let tracker = SessionTracker::new(Duration::from_millis(50));
        let scope = scope();
        let user = UserId::new();

        tracker.start(scope.clone(), user, SessionAction::Editing);
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(20));
            assert!(tracker.heartbeat(&scope, user));
        }

        assert_eq!(tracker.active(&scope).len(), 1);
        assert!(tracker.evict_expired().is_empty());
    }

    #[test]
    fn heartbeat_for_unknown_session_is_false() {
        let tracker = SessionTracker::new(SessionTracker::DEFAULT_TTL);
        assert!(!tracker.heartbeat(&scope(), UserId::new()));
    }
}
