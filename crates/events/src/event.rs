//! Record-change and presence-change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use recordguard_core::{RecordId, RecordScope, UserId, VersionedRecord};

/// What happened to a record or a session on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A write committed against the record.
    RecordSaved,
    /// A user opened a viewing/editing session.
    SessionStarted,
    /// A user closed their session explicitly.
    SessionEnded,
    /// The reaper evicted a stale session.
    SessionExpired,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::RecordSaved => "record_saved",
            ChangeKind::SessionStarted => "session_started",
            ChangeKind::SessionEnded => "session_ended",
            ChangeKind::SessionExpired => "session_expired",
        }
    }
}

/// The unit of fan-out: `{event, table, record_id, payload}` plus the
/// metadata a subscriber needs to order and attribute the change.
///
/// Delivery is best-effort and at-most-once; there is no replay buffer. A
/// subscriber that was not listening at publish time never sees the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub record_id: RecordId,
    /// Committed record version for `RecordSaved`; absent for session events.
    pub version: Option<u64>,
    pub user_id: Option<UserId>,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn record_saved(table: impl Into<String>, record: &VersionedRecord, user: UserId) -> Self {
        Self {
            kind: ChangeKind::RecordSaved,
            table: table.into(),
            record_id: record.id,
            version: Some(record.version),
            user_id: Some(user),
            payload: json!(record),
            occurred_at: Utc::now(),
        }
    }

    pub fn session_started(scope: &RecordScope, user: UserId, action: &str) -> Self {
        Self::session(ChangeKind::SessionStarted, scope, user, action)
    }

    pub fn session_ended(scope: &RecordScope, user: UserId, action: &str) -> Self {
        Self::session(ChangeKind::SessionEnded, scope, user, action)
    }

    pub fn session_expired(scope: &RecordScope, user: UserId, action: &str) -> Self {
        Self::session(ChangeKind::SessionExpired, scope, user, action)
    }

    fn session(kind: ChangeKind, scope: &RecordScope, user: UserId, action: &str) -> Self {
        Self {
            kind,
            table: scope.table.clone(),
            record_id: scope.record_id,
            version: None,
            user_id: Some(user),
            payload: json!({ "action": action }),
            occurred_at: Utc::now(),
        }
    }

    pub fn scope(&self) -> RecordScope {
        RecordScope::new(self.table.clone(), self.record_id)
    }
}
