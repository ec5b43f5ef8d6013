use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use recordguard_core::{ExpectedVersion, RecordId, UserId, VersionedRecord};

/// The field values and attribution a save wants to apply.
///
/// The store overlays `fields` onto the stored record, advances `version` by
/// one and stamps `last_modified_by`/`updated_at`. Business fields absent
/// from the patch are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub fields: Map<String, Value>,
    pub modified_by: UserId,
    pub modified_at: DateTime<Utc>,
}

impl RecordPatch {
    pub fn new(fields: Map<String, Value>, modified_by: UserId) -> Self {
        Self {
            fields,
            modified_by,
            modified_at: Utc::now(),
        }
    }
}

/// Version store operation error.
///
/// `VersionMismatch` carries only the expectation: a SQL-style conditional
/// update that matched zero rows reveals nothing about the version actually
/// stored, so callers that need the current state must re-read.
/// `Unavailable` is the transient class (network/db outage) eligible for
/// retry with backoff; `Storage` is not.
#[derive(Debug, Error)]
pub enum VersionStoreError {
    #[error("record not found")]
    NotFound,

    #[error("version predicate failed (expected {expected:?})")]
    VersionMismatch { expected: ExpectedVersion },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl VersionStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VersionStoreError::Unavailable(_))
    }
}

/// The narrow contract the engine depends on. Two operations only.
///
/// `conditional_update` MUST be atomic with respect to concurrent callers:
/// a compare-and-swap on the version column, e.g.
/// `UPDATE <table> SET <patch>, version = version + 1
///  WHERE id = :id AND version = :expected RETURNING *`
/// (zero rows back signals the mismatch). `ExpectedVersion::Any` is the
/// unconditional form of the same statement (no version predicate): it still
/// advances the version from whatever the store currently holds, never from
/// a caller-supplied number. Any store offering atomic conditional writes
/// satisfies the contract; nothing else is assumed about the technology.
pub trait VersionStore: Send + Sync {
    /// Fetch the current row, or `None` if the record does not exist.
    fn get(&self, table: &str, id: RecordId) -> Result<Option<VersionedRecord>, VersionStoreError>;

    /// Atomically apply `patch` if the stored version matches `expected`,
    /// returning the updated row.
    fn conditional_update(
        &self,
        table: &str,
        id: RecordId,
        patch: RecordPatch,
        expected: ExpectedVersion,
    ) -> Result<VersionedRecord, VersionStoreError>;
}

impl<S> VersionStore for Arc<S>
where
    S: VersionStore + ?Sized,
{
    fn get(&self, table: &str, id: RecordId) -> Result<Option<VersionedRecord>, VersionStoreError> {
        (**self).get(table, id)
    }

    fn conditional_update(
        &self,
        table: &str,
        id: RecordId,
        patch: RecordPatch,
        expected: ExpectedVersion,
    ) -> Result<VersionedRecord, VersionStoreError> {
        (**self).conditional_update(table, id, patch, expected)
    }
}
