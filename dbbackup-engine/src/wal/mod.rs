//! WAL archiving, restore and timeline reconstruction.

pub mod archiver;
pub mod segment;
pub mod timeline;

pub use archiver::{WalArchiver, WalKey};
pub use segment::{parse_history_name, parse_segment_name, ArchiveMode, WalSegmentRecord};
pub use timeline::{TimelineHistory, TimelineInfo};
