//! Filesystem helpers: lazy directory walking and file metadata.

pub mod metadata;
pub mod walker;

pub use metadata::FileMetadata;
pub use walker::{walk_entries, EntryKind, FileEntry};
