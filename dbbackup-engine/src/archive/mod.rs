//! tar.gz archive codec.
//!
//! The writer streams [`FileEntry`](crate::fs::FileEntry) values into a
//! gzip-compressed tar; the reader extracts one into a target directory,
//! refusing any entry whose path would land outside of it. Both check the
//! cancellation scope between entries.

pub mod reader;
pub mod writer;

pub use reader::{extract_archive, list_entries, ExtractStats};
pub use writer::{pack_directory, write_archive, ArchiveStats};
