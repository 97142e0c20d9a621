//! Human-readable session log
//!
//! The run log is append-only across sessions so a resumed session's history
//! stays next to the original one.

use crate::record::RunRecord;
use crate::telemetry::SamplerStats;
use crate::Result;
use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Host and collaborator details captured at session start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    pub os: String,
    pub arch: String,
    pub logical_cpus: usize,
    pub hostname: Option<String>,
    pub engine_version: Option<String>,
    pub gpu: Option<String>,
}

impl EnvironmentSnapshot {
    /// Capture host details; collaborator fields are filled in by the caller
    pub fn capture() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            logical_cpus: num_cpus::get(),
            hostname: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
            engine_version: None,
            gpu: None,
        }
    }

    fn lines(&self) -> Vec<String> {
        let unknown = || "unknown".to_string();
        vec![
            format!("host: {}", self.hostname.clone().unwrap_or_else(unknown)),
            format!("os: {} ({})", self.os, self.arch),
            format!("logical cpus: {}", self.logical_cpus),
            format!("engine: {}", self.engine_version.clone().unwrap_or_else(unknown)),
            format!("gpu: {}", self.gpu.clone().unwrap_or_else(unknown)),
        ]
    }
}

/// Append-only text log of one output directory's sessions
pub struct RunLog {
    file: File,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Write one timestamped line. Failures are logged, never propagated.
    pub fn line(&mut self, message: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Err(e) = writeln!(self.file, "[{}] {}", stamp, message) {
            warn!("Failed to write run log: {}", e);
        }
    }

    pub fn session_started(&mut self, resumed: bool, description: &str, env: &EnvironmentSnapshot) {
        let marker = if resumed { "SESSION RESUMED" } else { "SESSION STARTED" };
        self.line(&format!("==== {} ====", marker));
        self.line(description);
        for line in env.lines() {
            self.line(&format!("  {}", line));
        }
    }

    pub fn warmup(&mut self, model: &str, iteration: u32, eval_rate: Option<f64>) {
        let rate = eval_rate
            .map(|r| format!("{:.2} tokens/s", r))
            .unwrap_or_else(|| "n/a".to_string());
        self.line(&format!("warmup {} #{}: eval rate {}", model, iteration, rate));
    }

    pub fn cell(&mut self, record: &RunRecord) {
        let status = if record.ran_this_time { "COMPLETED" } else { "SKIPPED (resume)" };
        let rate = record
            .metrics
            .eval_rate
            .map(|r| format!("{:.2} tokens/s", r))
            .unwrap_or_else(|| "n/a".to_string());
        let mut message = format!(
            "{} {} / {} / {} r{}: eval rate {}",
            status, record.model, record.mode, record.prompt_id, record.repeat_index, rate
        );
        if !record.parse_warnings.is_empty() {
            message.push_str(&format!(" [warnings: {}]", record.warnings_joined()));
        }
        self.line(&message);
    }

    pub fn session_finished(&mut self, records: &[RunRecord], sampler: SamplerStats) {
        let ran = records.iter().filter(|r| r.ran_this_time).count();
        self.line(&format!(
            "==== SESSION COMPLETE: {} records ({} run, {} skipped), \
             {} telemetry samples, {} failed ticks ====",
            records.len(),
            ran,
            records.len() - ran,
            sampler.samples_written,
            sampler.failed_ticks
        ));
    }
}
