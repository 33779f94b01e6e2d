//! WAL file naming.
//!
//! A segment name is 24 hex digits: 8 for the timeline, 16 for the segment
//! index (log id and segment number). Archived copies carry a suffix
//! describing how they were processed.

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const SEGMENT_NAME_LEN: usize = 24;
pub const HISTORY_SUFFIX: &str = ".history";

/// `(timeline, segment index)` of a segment file name
pub fn parse_segment_name(name: &str) -> Result<(u32, u64)> {
    if name.len() != SEGMENT_NAME_LEN || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EngineError::Config(format!("invalid WAL segment name '{}'", name)));
    }
    let timeline = u32::from_str_radix(&name[..8], 16)
        .map_err(|e| EngineError::Config(format!("invalid timeline in '{}': {}", name, e)))?;
    let segment = u64::from_str_radix(&name[8..], 16)
        .map_err(|e| EngineError::Config(format!("invalid segment in '{}': {}", name, e)))?;
    Ok((timeline, segment))
}

/// Timeline of a `<TLI>.history` file name
pub fn parse_history_name(name: &str) -> Option<u32> {
    let tli = name.strip_suffix(HISTORY_SUFFIX)?;
    if tli.len() != 8 || !tli.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(tli, 16).ok()
}

pub fn history_file_name(timeline: u32) -> String {
    format!("{:08X}{}", timeline, HISTORY_SUFFIX)
}

/// How a segment is stored in the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveMode {
    pub compressed: bool,
    pub encrypted: bool,
}

impl ArchiveMode {
    /// All modes, most processed first; the order restore probes them in
    pub const ALL: [ArchiveMode; 4] = [
        ArchiveMode { compressed: true, encrypted: true },
        ArchiveMode { compressed: true, encrypted: false },
        ArchiveMode { compressed: false, encrypted: true },
        ArchiveMode { compressed: false, encrypted: false },
    ];

    /// Compression always happens before encryption, hence `.gz.enc`
    pub fn suffix(&self) -> &'static str {
        match (self.compressed, self.encrypted) {
            (true, true) => ".gz.enc",
            (true, false) => ".gz",
            (false, true) => ".enc",
            (false, false) => "",
        }
    }

    pub fn archived_name(&self, segment: &str) -> String {
        format!("{}{}", segment, self.suffix())
    }

    /// Split an archived file name into segment name and mode
    pub fn split(archived: &str) -> (&str, ArchiveMode) {
        for mode in ArchiveMode::ALL {
            let suffix = mode.suffix();
            if !suffix.is_empty() {
                if let Some(base) = archived.strip_suffix(suffix) {
                    return (base, mode);
                }
            }
        }
        (archived, ArchiveMode::default())
    }
}

/// One archived segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalSegmentRecord {
    pub file_name: String,
    pub timeline: u32,
    pub segment: u64,
    pub archive_path: PathBuf,
    /// Known only at archive time
    pub original_size: Option<u64>,
    pub archived_size: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub archived_at: DateTime<Utc>,
}
