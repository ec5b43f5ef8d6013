//! The narrow storage boundary: read-by-id and conditional-update-by-version.

mod in_memory;
mod r#trait;

pub use in_memory::InMemoryVersionStore;
pub use r#trait::{RecordPatch, VersionStore, VersionStoreError};
