//! Presence: who is viewing/editing which record, with TTL-based expiry.

mod reaper;
mod tracker;

pub use reaper::{ReaperConfig, ReaperHandle, ReaperStats};
pub use tracker::{Session, SessionAction, SessionTracker};
