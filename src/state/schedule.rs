//! Persisted schedule parameters.
//!
//! Only the parameters are stored, never the computed timers: after a restart
//! the schedule engine recomputes its deadlines from the current time.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ScheduleState {
    /// Recurring daily window.
    Interval {
        #[serde(with = "hhmm")]
        start: NaiveTime,
        #[serde(with = "hhmm")]
        end: NaiveTime,
        updated_at: DateTime<Utc>,
    },
    /// One-shot window ending at an absolute instant.
    Duration {
        end_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
}

impl ScheduleState {
    pub fn interval(start: NaiveTime, end: NaiveTime) -> Self {
        Self::Interval {
            start,
            end,
            updated_at: Utc::now(),
        }
    }

    pub fn duration(end_at: DateTime<Utc>) -> Self {
        Self::Duration {
            end_at,
            updated_at: Utc::now(),
        }
    }
}

/// `"HH:MM"` encoding for times of day.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn parse(value: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(value.trim(), FORMAT)
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let value = String::deserialize(deserializer)?;
        parse(&value).map_err(serde::de::Error::custom)
    }
}

/// File-backed [`ScheduleState`]. Absence of the file means no schedule.
#[derive(Debug, Clone)]
pub struct ScheduleStateFile {
    path: PathBuf,
}

impl ScheduleStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<ScheduleState> {
        super::read_json(&self.path)
    }

    pub fn save(&self, state: &ScheduleState) -> Result<(), StateError> {
        super::write_json(&self.path, state)
    }

    pub fn clear(&self) -> Result<(), StateError> {
        super::remove(&self.path)
    }
}
