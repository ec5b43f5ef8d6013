//! The concurrency manager: the public save/resolve/session surface.
//!
//! Orchestrates the version store, the conflict detector, the presence
//! tracker and the change notifier. The manager holds no locks across a
//! client's read-then-edit gap; correctness under concurrent writers rests
//! entirely on the store's atomic conditional update. The save pipeline is:
//!
//! ```text
//! safe_save(draft, expected_version)
//!   ↓
//! 1. CAS at the expected version       (the common, uncontended case)
//!   ↓ (mismatch)
//! 2. Fetch current snapshot            (NotFound => record was deleted)
//!   ↓
//! 3. Field diff (ConflictDetector)
//!   ↓
//! 4a. no collisions  → rescue: overlay draft, CAS from current version
//! 4b. collisions     → Fail/Merge: conflict report; Force: overwrite
//!   ↓
//! 5. Publish RecordSaved, clear the caller's session
//! ```
//!
//! Conflicts are values, never errors: a `ConflictReport` gives the caller
//! both snapshots and the colliding fields for a "yours vs. theirs" UI.
//! Store calls are bounded by `save_timeout`; a timed-out write may still
//! land, so every later attempt re-reads the current version instead of
//! trusting anything cached.
//!
//! Commit and publish for one record happen under a per-record mutex, so a
//! subscriber sees that record's events in commit order. No ordering is
//! guaranteed across records.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use chrono::{DateTime, Utc};

use recordguard_core::{
    ConflictDetector, ConflictReport, ExpectedVersion, RecordDraft, RecordId, RecordScope,
    SubscriptionId, UserId, VersionedRecord,
};
use recordguard_events::{ChangeEvent, ChangeNotifier, Subscription};

use crate::retry::RetryPolicy;
use crate::sessions::{ReaperConfig, ReaperHandle, SessionAction, SessionTracker};
use crate::version_store::{RecordPatch, VersionStore, VersionStoreError};

/// How many times a mismatched save re-reads and retries before giving up.
/// Only reached under sustained write contention on a single record.
const RESCUE_ATTEMPTS: u32 = 3;

/// What to do when a save hits a real field collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStrategy {
    /// Surface the conflict to the caller.
    #[default]
    Fail,
    /// Overwrite: advance from the *current* server version, never the stale
    /// expectation. Opt-in and user-directed ("keep mine").
    Force,
    /// Auto-combine disjoint changes; collisions surface like `Fail` (silent
    /// last-write-wins is only allowed under `Force`).
    Merge,
}

/// Caller's decision for a surfaced conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionChoice {
    /// Force-save the local fields from the report.
    KeepLocal,
    /// Take the server snapshot; no write happens.
    KeepServer,
    /// Force-save caller-merged fields (e.g. built from
    /// `ConflictReport::merged_fields` plus hand-picked values).
    Custom(Map<String, Value>),
}

/// Result of a save or resolution that reached a decision.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Saved(VersionedRecord),
    Conflict(Box<ConflictReport>),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }

    pub fn record(&self) -> Option<&VersionedRecord> {
        match self {
            SaveOutcome::Saved(record) => Some(record),
            SaveOutcome::Conflict(_) => None,
        }
    }

    pub fn conflict(&self) -> Option<&ConflictReport> {
        match self {
            SaveOutcome::Saved(_) => None,
            SaveOutcome::Conflict(report) => Some(report),
        }
    }
}

/// Save pipeline error.
///
/// Conflicts are NOT here: they come back as `SaveOutcome::Conflict` values.
#[derive(Debug, Error)]
pub enum SaveError {
    /// Record deleted concurrently; the caller must reload before retrying.
    #[error("record not found")]
    NotFound,

    /// The bounded wait on the store elapsed. Distinct from a conflict; the
    /// underlying write may or may not have landed. Retrying is the caller's
    /// choice.
    #[error("store call timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// Transient store failure; safe to retry after backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Non-transient store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Rescue/force budget exhausted under sustained contention.
    #[error("contention: {0}")]
    Contention(String),
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Bounded wait per store call.
    pub save_timeout: Duration,
    /// Session inactivity TTL.
    pub session_ttl: Duration,
    /// Reaper scan period.
    pub reaper_interval: Duration,
    /// Skip the field diff when fewer than two editing sessions are active
    /// on the record, treating the mismatch as a false positive. Off by
    /// default: a vanished session (crash, dropped network) can mask a real
    /// conflict, so the default always diffs and uses presence only to
    /// annotate the report.
    pub presence_gated_detection: bool,
    /// Backoff for transient store errors.
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            save_timeout: Duration::from_secs(5),
            session_ttl: SessionTracker::DEFAULT_TTL,
            reaper_interval: Duration::from_secs(30),
            presence_gated_detection: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout = timeout;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_presence_gate(mut self, enabled: bool) -> Self {
        self.presence_gated_detection = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Manager runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStats {
    pub saves_attempted: u64,
    pub saves_committed: u64,
    pub conflicts_detected: u64,
    pub forced_saves: u64,
    /// Version mismatches that turned out to be false positives (no field
    /// collisions) and were committed from the current version.
    pub rescued_mismatches: u64,
    pub timeouts: u64,
}

/// A non-expired session as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub user_id: UserId,
    pub action: SessionAction,
    pub started_at: DateTime<Utc>,
}

enum CasOutcome {
    Committed(VersionedRecord),
    Mismatch,
}

/// The public save/resolve/session API.
///
/// Construct one instance per process at startup and inject it by reference;
/// there is no global. Construction starts the session reaper; `shutdown()`
/// (or dropping the manager) stops it.
pub struct ConcurrencyManager {
    store: Arc<dyn VersionStore>,
    detector: ConflictDetector,
    sessions: Arc<SessionTracker>,
    notifier: Arc<ChangeNotifier>,
    config: ManagerConfig,
    commit_locks: Mutex<HashMap<RecordScope, Arc<Mutex<()>>>>,
    stats: Arc<Mutex<ManagerStats>>,
    reaper: Option<ReaperHandle>,
}

impl std::fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("config", &self.config)
            .field("sessions", &self.sessions.session_count())
            .finish()
    }
}

impl ConcurrencyManager {
    pub fn new(store: Arc<dyn VersionStore>, config: ManagerConfig) -> Self {
        let sessions = SessionTracker::arc(config.session_ttl);
        let notifier = Arc::new(ChangeNotifier::new());
        let reaper = ReaperHandle::spawn(
            sessions.clone(),
            notifier.clone(),
            ReaperConfig::default().with_interval(config.reaper_interval),
        );

        Self {
            store,
            detector: ConflictDetector::new(),
            sessions,
            notifier,
            config,
            commit_locks: Mutex::new(HashMap::new()),
            stats: Arc::new(Mutex::new(ManagerStats::default())),
            reaper: Some(reaper),
        }
    }

    /// Replace the default detector (e.g. to declare read-only fields).
    pub fn with_detector(mut self, detector: ConflictDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Stop the reaper. Also runs on drop; calling it explicitly makes
    /// teardown deterministic in tests.
    pub fn shutdown(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.shutdown();
        }
    }

    // ---- presence ----------------------------------------------------

    /// Register presence. Side effect only: presence failures degrade to a
    /// logged no-op, they never fail a caller.
    pub fn start_session(&self, table: &str, id: RecordId, user: UserId, action: SessionAction) {
        let scope = RecordScope::new(table, id);
        let session = self.sessions.start(scope.clone(), user, action);
        self.notifier
            .publish(&ChangeEvent::session_started(&scope, user, session.action.as_str()));
    }

    /// Remove the caller's session. Idempotent.
    pub fn end_session(&self, table: &str, id: RecordId, user: UserId) {
        let scope = RecordScope::new(table, id);
        if let Some(session) = self.sessions.end(&scope, user) {
            self.notifier
                .publish(&ChangeEvent::session_ended(&scope, user, session.action.as_str()));
        }
    }

    /// Refresh the caller's session. Returns whether one was found.
    pub fn heartbeat(&self, table: &str, id: RecordId, user: UserId) -> bool {
        self.sessions.heartbeat(&RecordScope::new(table, id), user)
    }

    /// Non-expired sessions on the record, most recently started first.
    pub fn active_users(&self, table: &str, id: RecordId) -> Vec<ActiveUser> {
        self.sessions
            .active(&RecordScope::new(table, id))
            .into_iter()
            .map(|s| ActiveUser {
                user_id: s.user_id,
                action: s.action,
                started_at: s.started_at,
            })
            .collect()
    }

    // ---- subscriptions -----------------------------------------------

    pub fn subscribe<F>(&self, table: &str, record_id: Option<RecordId>, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + 'static,
    {
        self.notifier.subscribe(table, record_id, callback)
    }

    pub fn subscribe_channel(
        &self,
        table: &str,
        record_id: Option<RecordId>,
    ) -> (SubscriptionId, Subscription<ChangeEvent>) {
        self.notifier.subscribe_channel(table, record_id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.notifier.unsubscribe(id);
    }

    pub fn notifier(&self) -> Arc<ChangeNotifier> {
        self.notifier.clone()
    }

    // ---- saving ------------------------------------------------------

    /// Attempt an optimistic save of `draft` against `expected_version`.
    ///
    /// On success the caller's session on the record is cleared and a
    /// `RecordSaved` event is published. On a version mismatch the conflict
    /// detector classifies the situation; see the module docs for the
    /// pipeline and `SaveStrategy` for what happens to real collisions.
    pub fn safe_save(
        &self,
        table: &str,
        draft: RecordDraft,
        expected_version: u64,
        strategy: SaveStrategy,
        user: UserId,
    ) -> Result<SaveOutcome, SaveError> {
        self.stat(|s| s.saves_attempted += 1);

        let scope = RecordScope::new(table, draft.id);
        let lock = self.commit_lock(&scope);
        let _ordering = lock.lock().unwrap_or_else(|e| e.into_inner());

        let patch = RecordPatch::new(draft.fields.clone(), user);
        match self.store_cas(table, draft.id, patch, ExpectedVersion::Exact(expected_version))? {
            CasOutcome::Committed(record) => Ok(SaveOutcome::Saved(self.commit(&scope, record, user))),
            CasOutcome::Mismatch => self.handle_mismatch(&scope, &draft, expected_version, strategy, user),
        }
    }

    /// Apply the caller's decision for a previously surfaced conflict.
    ///
    /// Never re-validates the expected version: the caller has already seen
    /// the conflict, resolution always advances from the current state.
    pub fn resolve_conflict(
        &self,
        report: &ConflictReport,
        choice: ResolutionChoice,
        user: UserId,
    ) -> Result<SaveOutcome, SaveError> {
        let scope = RecordScope::new(report.table.clone(), report.server_snapshot.id);

        match choice {
            ResolutionChoice::KeepServer => {
                // Surrendering needs no write; just close out the edit.
                if let Some(session) = self.sessions.end(&scope, user) {
                    self.notifier
                        .publish(&ChangeEvent::session_ended(&scope, user, session.action.as_str()));
                }
                Ok(SaveOutcome::Saved(report.server_snapshot.clone()))
            }
            ResolutionChoice::KeepLocal => {
                let lock = self.commit_lock(&scope);
                let _ordering = lock.lock().unwrap_or_else(|e| e.into_inner());
                self.stat(|s| s.forced_saves += 1);
                self.force_commit(&scope, report.local_snapshot.fields.clone(), user)
            }
            ResolutionChoice::Custom(fields) => {
                let lock = self.commit_lock(&scope);
                let _ordering = lock.lock().unwrap_or_else(|e| e.into_inner());
                self.stat(|s| s.forced_saves += 1);
                self.force_commit(&scope, fields, user)
            }
        }
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    // ---- internals ---------------------------------------------------

    /// Classify a version mismatch and either rescue, report or overwrite.
    fn handle_mismatch(
        &self,
        scope: &RecordScope,
        draft: &RecordDraft,
        expected_version: u64,
        strategy: SaveStrategy,
        user: UserId,
    ) -> Result<SaveOutcome, SaveError> {
        for _ in 0..RESCUE_ATTEMPTS {
            let current = self
                .store_get(&scope.table, draft.id)?
                .ok_or(SaveError::NotFound)?;

            let editing: Vec<UserId> = self
                .sessions
                .active(scope)
                .into_iter()
                .filter(|s| s.action == SessionAction::Editing)
                .map(|s| s.user_id)
                .collect();

            let skip_diff = self.config.presence_gated_detection && editing.len() < 2;
            let conflicting = if skip_diff {
                debug!(scope = %scope, "presence gate: single editor, skipping field diff");
                BTreeSet::new()
            } else {
                self.detector.conflicting_fields(&current, draft)
            };

            if conflicting.is_empty() {
                // False-positive mismatch (the caller's own earlier save, or
                // a concurrent change to fields the draft never touched):
                // overlay the draft on the current snapshot and commit from
                // the current version.
                let patch = RecordPatch::new(draft.fields.clone(), user);
                match self.store_cas(
                    &scope.table,
                    draft.id,
                    patch,
                    ExpectedVersion::Exact(current.version),
                )? {
                    CasOutcome::Committed(record) => {
                        debug!(scope = %scope, version = record.version, "rescued false-positive mismatch");
                        self.stat(|s| s.rescued_mismatches += 1);
                        return Ok(SaveOutcome::Saved(self.commit(scope, record, user)));
                    }
                    // Lost another race; re-read and re-diff.
                    CasOutcome::Mismatch => continue,
                }
            }

            return match strategy {
                SaveStrategy::Fail | SaveStrategy::Merge => {
                    self.stat(|s| s.conflicts_detected += 1);
                    Ok(SaveOutcome::Conflict(Box::new(ConflictReport::new(
                        scope.table.clone(),
                        expected_version,
                        current,
                        draft.clone(),
                        conflicting,
                        editing,
                    ))))
                }
                SaveStrategy::Force => {
                    self.stat(|s| s.forced_saves += 1);
                    self.force_commit(scope, draft.fields.clone(), user)
                }
            };
        }

        Err(SaveError::Contention(format!(
            "gave up after {RESCUE_ATTEMPTS} rescue attempts on {scope}"
        )))
    }

    /// Unconditional overwrite. The store advances the version from whatever
    /// it currently holds (`ExpectedVersion::Any`), never from a
    /// caller-supplied stale number.
    fn force_commit(
        &self,
        scope: &RecordScope,
        fields: Map<String, Value>,
        user: UserId,
    ) -> Result<SaveOutcome, SaveError> {
        let patch = RecordPatch::new(fields, user);
        match self.store_cas(&scope.table, scope.record_id, patch, ExpectedVersion::Any)? {
            CasOutcome::Committed(record) => Ok(SaveOutcome::Saved(self.commit(scope, record, user))),
            CasOutcome::Mismatch => Err(SaveError::Storage(
                "store reported a version mismatch for an unconditional update".to_string(),
            )),
        }
    }

    /// Post-commit bookkeeping: stats, session clearing, event publication.
    fn commit(&self, scope: &RecordScope, record: VersionedRecord, user: UserId) -> VersionedRecord {
        self.stat(|s| s.saves_committed += 1);

        self.notifier
            .publish(&ChangeEvent::record_saved(&scope.table, &record, user));

        if let Some(session) = self.sessions.end(scope, user) {
            self.notifier
                .publish(&ChangeEvent::session_ended(scope, user, session.action.as_str()));
        }

        record
    }

    fn store_get(&self, table: &str, id: RecordId) -> Result<Option<VersionedRecord>, SaveError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let table_owned = table.to_string();
            match self.bounded(move |store| store.get(&table_owned, id))? {
                Ok(record) => return Ok(record),
                Err(e) if e.is_transient() && self.config.retry.should_retry(attempt) => {
                    warn!(table, attempt, error = %e, "transient store error on get, backing off");
                    thread::sleep(self.config.retry.delay_for_attempt(attempt));
                }
                Err(VersionStoreError::NotFound) => return Ok(None),
                Err(VersionStoreError::Unavailable(msg)) => return Err(SaveError::Unavailable(msg)),
                Err(VersionStoreError::Storage(msg)) => return Err(SaveError::Storage(msg)),
                Err(e @ VersionStoreError::VersionMismatch { .. }) => {
                    return Err(SaveError::Storage(format!("unexpected error from get: {e}")));
                }
            }
        }
    }

    fn store_cas(
        &self,
        table: &str,
        id: RecordId,
        patch: RecordPatch,
        expected: ExpectedVersion,
    ) -> Result<CasOutcome, SaveError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let table_owned = table.to_string();
            let patch_clone = patch.clone();
            match self.bounded(move |store| {
                store.conditional_update(&table_owned, id, patch_clone, expected)
            })? {
                Ok(record) => return Ok(CasOutcome::Committed(record)),
                Err(VersionStoreError::VersionMismatch { .. }) => return Ok(CasOutcome::Mismatch),
                Err(VersionStoreError::NotFound) => return Err(SaveError::NotFound),
                Err(e) if e.is_transient() && self.config.retry.should_retry(attempt) => {
                    warn!(table, attempt, error = %e, "transient store error on update, backing off");
                    thread::sleep(self.config.retry.delay_for_attempt(attempt));
                }
                Err(VersionStoreError::Unavailable(msg)) => return Err(SaveError::Unavailable(msg)),
                Err(VersionStoreError::Storage(msg)) => return Err(SaveError::Storage(msg)),
            }
        }
    }

    /// Run a store call on a worker thread, bounded by `save_timeout`.
    ///
    /// On expiry the call may still land in the store; the pipeline never
    /// reuses state from before a timeout, so a landed write is observed as
    /// a normal version advance on the next attempt.
    fn bounded<T, F>(&self, op: F) -> Result<Result<T, VersionStoreError>, SaveError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn VersionStore>) -> Result<T, VersionStoreError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let store = Arc::clone(&self.store);
        thread::spawn(move || {
            let _ = tx.send(op(store));
        });

        match rx.recv_timeout(self.config.save_timeout) {
            Ok(result) => Ok(result),
            Err(_) => {
                self.stat(|s| s.timeouts += 1);
                Err(SaveError::Timeout {
                    elapsed: self.config.save_timeout,
                })
            }
        }
    }

    fn commit_lock(&self, scope: &RecordScope) -> Arc<Mutex<()>> {
        let mut locks = self
            .commit_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks.entry(scope.clone()).or_default().clone()
    }

    fn stat(&self, f: impl FnOnce(&mut ManagerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

impl Drop for ConcurrencyManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
