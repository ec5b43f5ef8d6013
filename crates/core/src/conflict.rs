//! Field-level conflict detection between a submitted draft and the current
//! server snapshot.
//!
//! Detection compares **normalized** values: JSON `null`, an absent field and
//! the empty string all count as "nothing there". (`serde_json` cannot
//! represent `NaN`; it arrives as `null` and is covered by the same rule.)
//!
//! When the draft carries the base snapshot of the fields it changed,
//! detection is three-way: a field collides only if the server moved away
//! from the base the client saw AND disagrees with the draft's new value.
//! Without a base, any submitted field that disagrees with the server counts
//! as a collision. Fields the draft did not touch never collide.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::UserId;
use crate::record::{RecordDraft, VersionedRecord};

/// Field names the detector skips by default: identity and engine-managed
/// metadata that may be mirrored into `fields` by row-shaped backends.
const DEFAULT_IGNORED: [&str; 5] = ["id", "version", "created_at", "updated_at", "last_modified_by"];

/// Detects which submitted fields truly collide with concurrent server-side
/// changes.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    ignored_fields: BTreeSet<String>,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self {
            ignored_fields: DEFAULT_IGNORED.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additionally ignore a read-only/derived field.
    pub fn with_ignored_field(mut self, name: impl Into<String>) -> Self {
        self.ignored_fields.insert(name.into());
        self
    }

    pub fn with_ignored_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_fields.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn ignored_fields(&self) -> &BTreeSet<String> {
        &self.ignored_fields
    }

    /// Compute the set of colliding field names for a draft against the
    /// current server snapshot.
    pub fn conflicting_fields(
        &self,
        server: &VersionedRecord,
        draft: &RecordDraft,
    ) -> BTreeSet<String> {
        let mut conflicting = BTreeSet::new();

        for (field, local) in &draft.fields {
            if self.ignored_fields.contains(field) {
                continue;
            }

            let current = server.fields.get(field);
            if values_equivalent(current, Some(local)) {
                // Server already holds the submitted value (e.g. the caller's
                // own earlier save landed); nothing to fight over.
                continue;
            }

            match draft.base.as_ref() {
                Some(base) => {
                    // Three-way: the server still holds what the client saw,
                    // so the draft is the only writer of this field.
                    if values_equivalent(current, base.get(field)) {
                        continue;
                    }
                    conflicting.insert(field.clone());
                }
                None => {
                    conflicting.insert(field.clone());
                }
            }
        }

        conflicting
    }

    pub fn has_conflict(&self, server: &VersionedRecord, draft: &RecordDraft) -> bool {
        !self.conflicting_fields(server, draft).is_empty()
    }
}

/// Normalized equivalence: absent, `null` and `""` are one value.
fn values_equivalent(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (normalize(a), normalize(b)) {
        (None, None) => true,
        (Some(x), Some(y)) => {
            // Numbers compare by value so `1` and `1.0` do not collide.
            if let (Some(xf), Some(yf)) = (x.as_f64(), y.as_f64()) {
                return xf == yf;
            }
            x == y
        }
        _ => false,
    }
}

fn normalize(v: Option<&Value>) -> Option<&Value> {
    match v {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        other => other,
    }
}

/// Everything a caller (and a "yours vs. theirs" UI) needs to resolve a
/// detected conflict. Built on demand; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub table: String,
    pub expected_version: u64,
    pub current_version: u64,
    pub conflicting_fields: BTreeSet<String>,
    pub server_snapshot: VersionedRecord,
    pub local_snapshot: RecordDraft,
    /// Who else holds an editing session on the record. Advisory only:
    /// presence annotates a conflict, it never decides one.
    pub active_editors: Vec<UserId>,
    pub message: String,
}

impl ConflictReport {
    pub fn new(
        table: impl Into<String>,
        expected_version: u64,
        server_snapshot: VersionedRecord,
        local_snapshot: RecordDraft,
        conflicting_fields: BTreeSet<String>,
        active_editors: Vec<UserId>,
    ) -> Self {
        let table = table.into();
        let message = format!(
            "record {}/{} changed concurrently (expected version {expected_version}, found {}): {} field(s) collide",
            table,
            server_snapshot.id,
            server_snapshot.version,
            conflicting_fields.len(),
        );
        Self {
            table,
            expected_version,
            current_version: server_snapshot.version,
            conflicting_fields,
            server_snapshot,
            local_snapshot,
            active_editors,
            message,
        }
    }

    /// The merged field set: server snapshot overlaid with the draft's
    /// non-colliding fields. Useful for building a `Custom` resolution.
    pub fn merged_fields(&self) -> Map<String, Value> {
        let mut merged = self.server_snapshot.fields.clone();
        for (field, value) in &self.local_snapshot.fields {
            if !self.conflicting_fields.contains(field) {
                merged.insert(field.clone(), value.clone());
            }
        }
        merged
    }
}
