//! Versioned records and the drafts callers submit against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::{RecordId, UserId};

/// A business record as held by the version store.
///
/// Business fields ride in `fields`; the engine never interprets them beyond
/// field-level comparison. Only `version`, `last_modified_by` and
/// `updated_at` are rewritten by the engine on a committed save.
///
/// Invariant: `version` increases by exactly 1 per committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub id: RecordId,
    pub version: u64,
    pub last_modified_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

impl VersionedRecord {
    /// Create a fresh record at version 1.
    pub fn new(id: RecordId, fields: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id,
            version: 1,
            last_modified_by: None,
            created_at: now,
            updated_at: now,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a business field (builder-style, for seeding and tests).
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// What a caller submits to a save: the changed fields (at least), plus
/// optionally the snapshot of those fields as last loaded.
///
/// Carrying `base` lets the conflict detector distinguish "the server moved
/// away from what I saw" from "I am the one changing this field", enabling
/// three-way detection. Without it, any submitted field that disagrees with
/// the server counts as a collision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub id: RecordId,
    pub fields: Map<String, Value>,
    pub base: Option<Map<String, Value>>,
}

impl RecordDraft {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            fields: Map::new(),
            base: None,
        }
    }

    /// Build a draft from a loaded record: empty change set, `base` captured
    /// from the record's current fields.
    pub fn from_record(record: &VersionedRecord) -> Self {
        Self {
            id: record.id,
            fields: Map::new(),
            base: Some(record.fields.clone()),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_base(mut self, base: Map<String, Value>) -> Self {
        self.base = Some(base);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The `(table, record_id)` key that scopes sessions, subscriptions and
/// per-record event ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordScope {
    pub table: String,
    pub record_id: RecordId,
}

impl RecordScope {
    pub fn new(table: impl Into<String>, record_id: RecordId) -> Self {
        Self {
            table: table.into(),
            record_id,
        }
    }
}

impl core::fmt::Display for RecordScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.table, self.record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn draft_from_record_captures_base() {
        let record = VersionedRecord::new(RecordId::new(), Map::new())
            .with_field("name", json!("Widget"));

        let draft = RecordDraft::from_record(&record).with_field("name", json!("Widget B"));

        assert_eq!(draft.id, record.id);
        assert_eq!(draft.fields.get("name"), Some(&json!("Widget B")));
        assert_eq!(
            draft.base.as_ref().and_then(|b| b.get("name")),
            Some(&json!("Widget"))
        );
    }

    #[test]
    fn scope_display_is_table_slash_id() {
        let id = RecordId::new();
        let scope = RecordScope::new("orders", id);
        assert_eq!(scope.to_string(), format!("orders/{id}"));
    }
}
