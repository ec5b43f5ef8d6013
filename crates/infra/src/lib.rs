//! Infrastructure layer: the version-store contract, presence tracking and
//! the concurrency manager that orchestrates them.

pub mod manager;
pub mod retry;
pub mod sessions;
pub mod version_store;


pub use manager::{
    ActiveUser, ConcurrencyManager, ManagerConfig, ManagerStats, ResolutionChoice, SaveError,
    SaveOutcome, SaveStrategy,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use sessions::{ReaperConfig, ReaperHandle, ReaperStats, Session, SessionAction, SessionTracker};
pub use version_store::{InMemoryVersionStore, RecordPatch, VersionStore, VersionStoreError};
