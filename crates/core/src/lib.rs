//! `recordguard-core` — domain foundation for multi-user record protection.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! versioned records, optimistic-version expectations, and field-level
//! conflict detection.

pub mod conflict;
pub mod error;
pub mod id;
pub mod record;
pub mod version;

pub use conflict::{ConflictDetector, ConflictReport};
pub use error::{DomainError, DomainResult};
pub use id::{RecordId, SubscriptionId, UserId};
pub use record::{RecordDraft, RecordScope, VersionedRecord};
pub use version::ExpectedVersion;
