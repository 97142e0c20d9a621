//! Per-run result records

use crate::correlate::WindowStats;
use crate::extract::MetricRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const WARN_ENGINE_ERROR: &str = "engine_error";
pub const WARN_ENGINE_TIMEOUT: &str = "engine_timeout";
pub const WARN_EMPTY_TRANSCRIPT: &str = "empty_transcript";
pub const WARN_NO_TELEMETRY: &str = "no_telemetry_samples";

/// Whether the model stays resident between repeats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchMode {
    /// Model stays loaded across repeats
    #[default]
    Steady,
    /// Model is unloaded before every repeat so load cost lands in each measurement
    Fresh,
}

impl BenchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Steady => "steady",
            Self::Fresh => "fresh",
        }
    }
}

impl fmt::Display for BenchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BenchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "steady" | "steady-state" | "steady_state" => Ok(Self::Steady),
            "fresh" => Ok(Self::Fresh),
            other => Err(format!("unknown benchmark mode: {}", other)),
        }
    }
}

/// One matrix cell × one repeat. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub model: String,
    pub prompt_id: String,
    pub repeat_index: u32,
    pub mode: BenchMode,
    /// Unset when the cell was skipped on resume
    pub run_start: Option<DateTime<Utc>>,
    pub run_end: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub metrics: MetricRecord,
    pub gpu: WindowStats,
    pub ran_this_time: bool,
    pub parse_warnings: BTreeSet<String>,
}

impl RunRecord {
    /// Wall-clock seconds spent in the engine invocation
    pub fn wall_seconds(&self) -> Option<f64> {
        match (self.run_start, self.run_end) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Warnings joined with `;` for tabular output
    pub fn warnings_joined(&self) -> String {
        self.parse_warnings.iter().cloned().collect::<Vec<_>>().join(";")
    }
}
