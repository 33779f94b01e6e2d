//! Point-in-time recovery: target validation and recovery-config generation.

pub mod recovery;
pub mod target;

pub use recovery::{detect_version, RecoveryConfigGenerator, RecoveryFiles};
pub use target::{RecoveryAction, RecoveryTarget, TargetKind, TargetTimeline};
