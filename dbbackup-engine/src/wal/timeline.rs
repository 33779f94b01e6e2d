//! Timeline graph reconstructed from `.history` files and archived segments.

use super::archiver::list_segments;
use super::segment::{history_file_name, parse_history_name, WalSegmentRecord};
use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Longest parent walk before the graph is declared cyclic
pub const MAX_TIMELINE_HOPS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineInfo {
    pub id: u32,
    /// 0 for a base timeline
    pub parent: u32,
    pub switch_point: String,
    pub reason: String,
    pub first_segment: Option<u64>,
    pub last_segment: Option<u64>,
    pub segment_count: usize,
}

impl TimelineInfo {
    fn base(id: u32) -> Self {
        Self {
            id,
            parent: 0,
            switch_point: "0/0".to_string(),
            reason: String::new(),
            first_segment: None,
            last_segment: None,
            segment_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimelineHistory {
    archive_dir: PathBuf,
    timelines: BTreeMap<u32, TimelineInfo>,
    segments: Vec<WalSegmentRecord>,
}

impl TimelineHistory {
    /// Scan `archive_dir` for history files and segments
    pub fn load(archive_dir: &Path) -> Result<Self> {
        let mut timelines = BTreeMap::new();

        if archive_dir.is_dir() {
            for entry in fs::read_dir(archive_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(id) = parse_history_name(&name) else {
                    continue;
                };
                let content = fs::read_to_string(entry.path())?;
                match parse_history(id, &content) {
                    Some(info) => {
                        timelines.insert(id, info);
                    }
                    None => warn!(file = %name, "history file has no entries, parent unknown"),
                }
            }
        }

        let segments = list_segments(archive_dir)?;
        for record in &segments {
            let info = timelines.entry(record.timeline).or_insert_with(|| {
                if record.timeline != 1 {
                    warn!(timeline = record.timeline, "segments without a usable history file, parent unknown");
                }
                TimelineInfo::base(record.timeline)
            });
            info.first_segment = Some(info.first_segment.map_or(record.segment, |s| s.min(record.segment)));
            info.last_segment = Some(info.last_segment.map_or(record.segment, |s| s.max(record.segment)));
            info.segment_count += 1;
        }
        timelines.entry(1).or_insert_with(|| TimelineInfo::base(1));

        debug!(timelines = timelines.len(), segments = segments.len(), "timeline history loaded");
        Ok(Self {
            archive_dir: archive_dir.to_path_buf(),
            timelines,
            segments,
        })
    }

    pub fn timelines(&self) -> impl Iterator<Item = &TimelineInfo> {
        self.timelines.values()
    }

    pub fn get(&self, id: u32) -> Option<&TimelineInfo> {
        self.timelines.get(&id)
    }

    /// Highest known timeline
    pub fn latest(&self) -> u32 {
        self.timelines.keys().next_back().copied().unwrap_or(1)
    }

    /// Every parent must exist and every walk must reach timeline 1
    pub fn validate(&self) -> Result<()> {
        for id in self.timelines.keys() {
            self.timeline_path(*id)?;
        }
        Ok(())
    }

    /// Timelines from the base down to `target`, e.g. `[1, 2, 3]`
    pub fn timeline_path(&self, target: u32) -> Result<Vec<u32>> {
        let mut path = Vec::new();
        let mut current = target;
        loop {
            if path.len() >= MAX_TIMELINE_HOPS {
                return Err(EngineError::ChainInconsistency(format!(
                    "cycle in timeline graph reached from timeline {}",
                    target
                )));
            }
            let info = self.timelines.get(&current).ok_or_else(|| {
                EngineError::ChainInconsistency(match path.last() {
                    Some(child) => format!("timeline {} references missing parent {}", child, current),
                    None => format!("timeline {} is unknown", current),
                })
            })?;
            path.push(current);
            if info.parent == 0 {
                // only timeline 1 starts a cluster; any other root lost its history
                if current != 1 {
                    return Err(EngineError::ChainInconsistency(format!(
                        "timeline {} has no usable history file, its parent is unknown",
                        current
                    )));
                }
                break;
            }
            current = info.parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Segments and history files needed to recover onto `target`
    pub fn required_files(&self, target: u32) -> Result<Vec<PathBuf>> {
        let path = self.timeline_path(target)?;
        let mut files = Vec::new();
        for id in path {
            let history = self.archive_dir.join(history_file_name(id));
            if history.is_file() {
                files.push(history);
            }
            files.extend(
                self.segments
                    .iter()
                    .filter(|s| s.timeline == id)
                    .map(|s| s.archive_path.clone()),
            );
        }
        Ok(files)
    }
}

/// The last entry of a history file describes the timeline's own fork
fn parse_history(id: u32, content: &str) -> Option<TimelineInfo> {
    let line = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .last()?;
    let mut fields = line.splitn(3, '\t');
    let parent = fields.next()?.trim().parse::<u32>().ok()?;
    let switch_point = fields.next().unwrap_or("0/0").trim().to_string();
    let reason = fields.next().unwrap_or("").trim().to_string();
    Some(TimelineInfo {
        id,
        parent,
        switch_point,
        reason,
        first_segment: None,
        last_segment: None,
        segment_count: 0,
    })
}
