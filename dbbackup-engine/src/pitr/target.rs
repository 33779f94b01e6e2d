use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const TIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];
const ZONED_TIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%#z", "%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S %#z"];
const MAX_RESTORE_POINT_NAME: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Time,
    Xid,
    Lsn,
    Name,
    Immediate,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Time => "time",
            TargetKind::Xid => "xid",
            TargetKind::Lsn => "lsn",
            TargetKind::Name => "name",
            TargetKind::Immediate => "immediate",
        }
    }

    /// The recovery parameter this kind sets
    pub fn parameter(&self) -> &'static str {
        match self {
            TargetKind::Time => "recovery_target_time",
            TargetKind::Xid => "recovery_target_xid",
            TargetKind::Lsn => "recovery_target_lsn",
            TargetKind::Name => "recovery_target_name",
            TargetKind::Immediate => "recovery_target",
        }
    }

    /// `recovery_target_inclusive` only applies to these kinds
    pub fn supports_inclusive(&self) -> bool {
        matches!(self, TargetKind::Time | TargetKind::Xid | TargetKind::Lsn)
    }
}

impl FromStr for TargetKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "time" => Ok(TargetKind::Time),
            "xid" => Ok(TargetKind::Xid),
            "lsn" => Ok(TargetKind::Lsn),
            "name" => Ok(TargetKind::Name),
            "immediate" => Ok(TargetKind::Immediate),
            other => Err(EngineError::Config(format!("unknown recovery target kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    #[default]
    Promote,
    Pause,
    Shutdown,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Promote => "promote",
            RecoveryAction::Pause => "pause",
            RecoveryAction::Shutdown => "shutdown",
        }
    }
}

impl FromStr for RecoveryAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "promote" => Ok(RecoveryAction::Promote),
            "pause" => Ok(RecoveryAction::Pause),
            "shutdown" => Ok(RecoveryAction::Shutdown),
            other => Err(EngineError::Config(format!("unknown recovery action '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TargetTimeline {
    #[default]
    Latest,
    Id(u32),
}

impl fmt::Display for TargetTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetTimeline::Latest => f.write_str("latest"),
            TargetTimeline::Id(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for TargetTimeline {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(TargetTimeline::Latest);
        }
        let id = s
            .strip_prefix("0x")
            .map(|hex| u32::from_str_radix(hex, 16))
            .unwrap_or_else(|| s.parse::<u32>())
            .map_err(|_| EngineError::Config(format!("invalid recovery timeline '{}'", s)))?;
        if id == 0 {
            return Err(EngineError::Config("recovery timeline must be positive".to_string()));
        }
        Ok(TargetTimeline::Id(id))
    }
}

/// Where recovery stops. Construct through [`RecoveryTarget::new`] so the
/// value is always valid for its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryTarget {
    kind: TargetKind,
    value: String,
    pub action: RecoveryAction,
    pub timeline: TargetTimeline,
    pub inclusive: bool,
}

impl RecoveryTarget {
    pub fn new(kind: TargetKind, value: impl Into<String>) -> Result<Self> {
        let value = value.into().trim().to_string();
        validate_value(kind, &value)?;
        Ok(Self {
            kind,
            value,
            action: RecoveryAction::default(),
            timeline: TargetTimeline::default(),
            inclusive: true,
        })
    }

    pub fn immediate() -> Self {
        Self {
            kind: TargetKind::Immediate,
            value: "immediate".to_string(),
            action: RecoveryAction::default(),
            timeline: TargetTimeline::default(),
            inclusive: true,
        }
    }

    pub fn with_action(mut self, action: RecoveryAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_timeline(mut self, timeline: TargetTimeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn with_inclusive(mut self, inclusive: bool) -> Self {
        self.inclusive = inclusive;
        self
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Recovery parameters in the order they are written
    pub fn parameters(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![(self.kind.parameter(), self.value.clone())];
        params.push(("recovery_target_action", self.action.as_str().to_string()));
        params.push(("recovery_target_timeline", self.timeline.to_string()));
        if self.kind.supports_inclusive() {
            params.push(("recovery_target_inclusive", self.inclusive.to_string()));
        }
        params
    }
}

fn validate_value(kind: TargetKind, value: &str) -> Result<()> {
    let invalid = |what: &str| EngineError::Config(format!("invalid recovery target {} '{}'", what, value));
    match kind {
        TargetKind::Time => {
            if is_valid_time(value) {
                Ok(())
            } else {
                Err(invalid("time"))
            }
        }
        TargetKind::Xid => match value.parse::<u64>() {
            Ok(xid) if xid > 0 => Ok(()),
            _ => Err(invalid("xid")),
        },
        TargetKind::Lsn => {
            let hex = |s: &str| !s.is_empty() && s.len() <= 8 && s.bytes().all(|b| b.is_ascii_hexdigit());
            match value.split_once('/') {
                Some((high, low)) if hex(high) && hex(low) => Ok(()),
                _ => Err(invalid("lsn")),
            }
        }
        TargetKind::Name => {
            let ok = !value.is_empty()
                && value.len() <= MAX_RESTORE_POINT_NAME
                && value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
            if ok {
                Ok(())
            } else {
                Err(invalid("name"))
            }
        }
        TargetKind::Immediate => {
            if value.is_empty() || value.eq_ignore_ascii_case("immediate") {
                Ok(())
            } else {
                Err(invalid("value for an immediate target"))
            }
        }
    }
}

fn is_valid_time(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || TIME_FORMATS.iter().any(|f| NaiveDateTime::parse_from_str(value, f).is_ok())
        || ZONED_TIME_FORMATS.iter().any(|f| DateTime::parse_from_str(value, f).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_formats() {
        for value in [
            "2024-11-26 12:00:00",
            "2024-11-26T12:00:00Z",
            "2024-11-26T12:00:00+02:00",
            "2024-11-26 12:00:00.123",
            "2024-11-26 12:00:00+01",
        ] {
            assert!(RecoveryTarget::new(TargetKind::Time, value).is_ok(), "{}", value);
        }
        assert!(RecoveryTarget::new(TargetKind::Time, "yesterday").is_err());
        assert!(RecoveryTarget::new(TargetKind::Time, "2024-13-01 00:00:00").is_err());
    }

    #[test]
    fn test_value_rules() {
        assert!(RecoveryTarget::new(TargetKind::Xid, "1234").is_ok());
        assert!(RecoveryTarget::new(TargetKind::Xid, "0").is_err());
        assert!(RecoveryTarget::new(TargetKind::Xid, "-4").is_err());
        assert!(RecoveryTarget::new(TargetKind::Lsn, "0/3000000").is_ok());
        assert!(RecoveryTarget::new(TargetKind::Lsn, "16/B374D848").is_ok());
        assert!(RecoveryTarget::new(TargetKind::Lsn, "0x3000000").is_err());
        assert!(RecoveryTarget::new(TargetKind::Lsn, "0/zz").is_err());
        assert!(RecoveryTarget::new(TargetKind::Name, "before_migration-2").is_ok());
        assert!(RecoveryTarget::new(TargetKind::Name, "has space").is_err());
        assert!(RecoveryTarget::new(TargetKind::Name, "x".repeat(64)).is_err());
    }

    #[test]
    fn test_parameters_for_kinds() {
        let target = RecoveryTarget::new(TargetKind::Name, "checkpoint_a")
            .unwrap()
            .with_action(RecoveryAction::Pause)
            .with_timeline(TargetTimeline::Id(3));
        let keys: Vec<_> = target.parameters().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["recovery_target_name", "recovery_target_action", "recovery_target_timeline"]);

        let immediate = RecoveryTarget::immediate().parameters();
        assert_eq!(immediate[0], ("recovery_target", "immediate".to_string()));
    }

    #[test]
    fn test_parsers() {
        assert_eq!("latest".parse::<TargetTimeline>().unwrap(), TargetTimeline::Latest);
        assert_eq!("0x0A".parse::<TargetTimeline>().unwrap(), TargetTimeline::Id(10));
        assert!("0".parse::<TargetTimeline>().is_err());
        assert_eq!("SHUTDOWN".parse::<RecoveryAction>().unwrap(), RecoveryAction::Shutdown);
        assert!("lsn".parse::<TargetKind>().is_ok());
        assert!("epoch".parse::<TargetKind>().is_err());
    }
}
