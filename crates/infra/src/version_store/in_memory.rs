use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use recordguard_core::{ExpectedVersion, RecordId, VersionedRecord};

use super::r#trait::{RecordPatch, VersionStore, VersionStoreError};

/// In-memory version store.
///
/// Intended for tests/dev. The write lock is held across the version check
/// and the mutation, so concurrent updates against the same expected version
/// admit exactly one winner.
#[derive(Debug, Default)]
pub struct InMemoryVersionStore {
    tables: RwLock<HashMap<String, HashMap<RecordId, VersionedRecord>>>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed a record (replacing any existing row with the same id).
    pub fn insert(&self, table: impl Into<String>, record: VersionedRecord) {
        let mut tables = self.tables.write().unwrap();
        tables.entry(table.into()).or_default().insert(record.id, record);
    }

    /// Delete a record, returning it if it existed.
    pub fn remove(&self, table: &str, id: RecordId) -> Option<VersionedRecord> {
        let mut tables = self.tables.write().unwrap();
        tables.get_mut(table).and_then(|rows| rows.remove(&id))
    }

    pub fn len(&self, table: &str) -> usize {
        let tables = self.tables.read().unwrap();
        tables.get(table).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

impl VersionStore for InMemoryVersionStore {
    fn get(&self, table: &str, id: RecordId) -> Result<Option<VersionedRecord>, VersionStoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| VersionStoreError::Storage("lock poisoned".to_string()))?;

        Ok(tables.get(table).and_then(|rows| rows.get(&id)).cloned())
    }

    fn conditional_update(
        &self,
        table: &str,
        id: RecordId,
        patch: RecordPatch,
        expected: ExpectedVersion,
    ) -> Result<VersionedRecord, VersionStoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| VersionStoreError::Storage("lock poisoned".to_string()))?;

        let record = tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or(VersionStoreError::NotFound)?;

        if !expected.matches(record.version) {
            return Err(VersionStoreError::VersionMismatch { expected });
        }

        record.version += 1;
        record.last_modified_by = Some(patch.modified_by);
        record.updated_at = patch.modified_at;
        for (field, value) in patch.fields {
            record.fields.insert(field, value);
        }

        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordguard_core::UserId;
    use serde_json::{Map, json};

    fn seeded(store: &InMemoryVersionStore, table: &str) -> VersionedRecord {
        let record = VersionedRecord::new(RecordId::new(), Map::new())
            .with_field("name", json!("Widget"))
            .with_field("qty", json!(3));
        store.insert(table, record.clone());
        record
    }

    fn patch_named(name: &str) -> RecordPatch {
        let mut fields = Map::new();
        fields.insert("name".to_string(), json!(name));
        RecordPatch::new(fields, UserId::new())
    }

    #[test]
    fn update_at_exact_version_advances_by_one() {
        let store = InMemoryVersionStore::new();
        let record = seeded(&store, "orders");

        let updated = store
            .conditional_update("orders", record.id, patch_named("Widget B"), ExpectedVersion::Exact(1))
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.fields.get("name"), Some(&json!("Widget B")));
        // Untouched business fields pass through.
        assert_eq!(updated.fields.get("qty"), Some(&json!(3)));
        assert!(updated.last_modified_by.is_some());
    }

    #[test]
    fn stale_expectation_is_rejected() {
        let store = InMemoryVersionStore::new();
        let record = seeded(&store, "orders");

        store
            .conditional_update("orders", record.id, patch_named("B"), ExpectedVersion::Exact(1))
            .unwrap();

        let err = store
            .conditional_update("orders", record.id, patch_named("C"), ExpectedVersion::Exact(1))
            .unwrap_err();
        assert!(matches!(err, VersionStoreError::VersionMismatch { .. }));

        // The losing write left no trace.
        let current = store.get("orders", record.id).unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.fields.get("name"), Some(&json!("B")));
    }

    #[test]
    fn any_expectation_skips_the_version_check() {
        let store = InMemoryVersionStore::new();
        let record = seeded(&store, "orders");

        store
            .conditional_update("orders", record.id, patch_named("B"), ExpectedVersion::Exact(1))
            .unwrap();
        let updated = store
            .conditional_update("orders", record.id, patch_named("C"), ExpectedVersion::Any)
            .unwrap();

        assert_eq!(updated.version, 3);
        assert_eq!(updated.fields.get("name"), Some(&json!("C")));
    }

    #[test]
    fn missing_record_is_not_found() {
        let store = InMemoryVersionStore::new();
        let err = store
            .conditional_update("orders", RecordId::new(), patch_named("X"), ExpectedVersion::Any)
            .unwrap_err();
        assert!(matches!(err, VersionStoreError::NotFound));
        assert!(store.get("orders", RecordId::new()).unwrap().is_none());
    }

    #[test]
    fn concurrent_updates_at_same_version_admit_one_winner() {
        let store = InMemoryVersionStore::arc();
        let record = seeded(&store, "orders");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = record.id;
                std::thread::spawn(move || {
                    store.conditional_update(
                        "orders",
                        id,
                        patch_named(&format!("writer-{i}")),
                        ExpectedVersion::Exact(1),
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);

        let current = store.get("orders", record.id).unwrap().unwrap();
        assert_eq!(current.version, 2);
    }
}
