//! GPU telemetry sampling
//!
//! A [`TelemetrySampler`] polls a [`GpuMonitor`] on a fixed interval and
//! appends one line per snapshot to a [`TelemetryLog`]. The sampler is the
//! log's only writer; readers see whatever complete lines exist at call time.

use crate::correlate::{correlate, WindowStats};
use crate::{BenchError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Point-in-time GPU state as reported by the monitoring utility
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    /// Memory in use (MiB)
    pub memory_used: f64,
    /// Total memory (MiB)
    pub memory_total: f64,
    /// Utilization (percent)
    pub utilization_pct: f64,
    /// Power draw (W)
    pub power_draw: f64,
    /// Temperature (°C)
    pub temperature: f64,
}

/// A timestamped snapshot. Immutable once appended to the log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub memory_used: f64,
    pub memory_total: f64,
    pub utilization_pct: f64,
    pub power_draw: f64,
    pub temperature: f64,
}

impl TelemetrySample {
    pub fn new(timestamp: DateTime<Utc>, snapshot: GpuSnapshot) -> Self {
        Self {
            timestamp,
            memory_used: snapshot.memory_used,
            memory_total: snapshot.memory_total,
            utilization_pct: snapshot.utilization_pct,
            power_draw: snapshot.power_draw,
            temperature: snapshot.temperature,
        }
    }

    /// Encode as one log line, newline included
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{},{}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.memory_used,
            self.memory_total,
            self.utilization_pct,
            self.power_draw,
            self.temperature,
        )
    }

    /// Decode a log line. Returns `None` for blank or malformed lines.
    pub fn from_line(line: &str) -> Option<Self> {
        let mut fields = line.trim().split(',').map(str::trim);
        let timestamp = DateTime::parse_from_rfc3339(fields.next()?)
            .ok()?
            .with_timezone(&Utc);
        let mut number = || fields.next()?.parse::<f64>().ok().filter(|v| v.is_finite());
        let sample = Self {
            timestamp,
            memory_used: number()?,
            memory_total: number()?,
            utilization_pct: number()?,
            power_draw: number()?,
            temperature: number()?,
        };
        if fields.next().is_some() {
            return None;
        }
        Some(sample)
    }
}

/// Source of GPU snapshots
#[async_trait]
pub trait GpuMonitor: Send + Sync {
    /// Query the current GPU state
    async fn query(&self) -> Result<GpuSnapshot>;

    /// Short human-readable description of the device, for the run log
    async fn describe(&self) -> Option<String> {
        None
    }
}

/// Parse one row of `nvidia-smi --format=csv,noheader,nounits` output.
///
/// Column order: memory.used, memory.total, utilization.gpu, power.draw, temperature.gpu.
pub fn parse_nvidia_smi_row(line: &str) -> Result<GpuSnapshot> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() != 5 {
        return Err(BenchError::Telemetry(format!(
            "expected 5 columns, found {}: {:?}",
            parts.len(),
            line
        )));
    }

    let value = |idx: usize| -> Result<f64> {
        parts[idx]
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| BenchError::Telemetry(format!("unparseable value {:?}", parts[idx])))
    };

    Ok(GpuSnapshot {
        memory_used: value(0)?,
        memory_total: value(1)?,
        utilization_pct: value(2)?,
        power_draw: value(3)?,
        temperature: value(4)?,
    })
}

/// [`GpuMonitor`] backed by the `nvidia-smi` command
#[derive(Debug, Clone)]
pub struct NvidiaSmiMonitor {
    command: PathBuf,
    index: Option<u32>,
}

impl NvidiaSmiMonitor {
    pub fn new(command: impl Into<PathBuf>, index: Option<u32>) -> Self {
        Self {
            command: command.into(),
            index,
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        if let Some(index) = self.index {
            cmd.arg("-i").arg(index.to_string());
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

impl Default for NvidiaSmiMonitor {
    fn default() -> Self {
        Self::new("nvidia-smi", None)
    }
}

#[async_trait]
impl GpuMonitor for NvidiaSmiMonitor {
    async fn query(&self) -> Result<GpuSnapshot> {
        let output = self
            .base_command()
            .args([
                "--query-gpu=memory.used,memory.total,utilization.gpu,power.draw,temperature.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await
            .map_err(|e| {
                BenchError::Telemetry(format!(
                    "failed to execute {}: {}",
                    self.command.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(BenchError::Telemetry(format!(
                "{} exited with status {}",
                self.command.display(),
                output.status.code().unwrap_or(-1)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let row = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| BenchError::Telemetry("no GPU rows returned".to_string()))?;
        parse_nvidia_smi_row(row)
    }

    async fn describe(&self) -> Option<String> {
        let output = self
            .base_command()
            .args(["--query-gpu=name,driver_version", "--format=csv,noheader"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }
}

/// Append-only, line-oriented telemetry store on disk
#[derive(Debug, Clone)]
pub struct TelemetryLog {
    path: PathBuf,
}

impl TelemetryLog {
    /// Open (or create) the log at `path`. Existing samples are kept.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one sample with a single write
    pub fn append(&self, sample: &TelemetrySample) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(sample.to_line().as_bytes())?;
        Ok(())
    }

    /// Read every complete sample currently in the log.
    ///
    /// A trailing line without its newline is still being written and is ignored.
    pub fn read_samples(&self) -> Result<Vec<TelemetrySample>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .split_inclusive('\n')
            .filter(|line| line.ends_with('\n'))
            .filter_map(TelemetrySample::from_line)
            .collect())
    }

    /// Correlate the samples in `[start, end]`. Read failures degrade to an empty window.
    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> WindowStats {
        match self.read_samples() {
            Ok(samples) => correlate(&samples, start, end),
            Err(e) => {
                warn!("Failed to read telemetry log {}: {}", self.path.display(), e);
                WindowStats::default()
            }
        }
    }
}

/// Tick counters reported when the sampler stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub samples_written: u64,
    pub failed_ticks: u64,
}

/// Background task polling a [`GpuMonitor`] for the lifetime of a session.
///
/// Dropping the sampler without calling [`TelemetrySampler::stop`] aborts the task.
pub struct TelemetrySampler {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<SamplerStats>>,
}

impl TelemetrySampler {
    /// Spawn the sampling task on the current tokio runtime
    pub fn start(monitor: Arc<dyn GpuMonitor>, log: TelemetryLog, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        info!(
            "Starting telemetry sampler every {:?} into {}",
            interval,
            log.path().display()
        );
        let handle = tokio::spawn(sample_loop(monitor, log, interval, shutdown_rx));
        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Signal the task to finish and wait for it
    pub async fn stop(mut self) -> SamplerStats {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let stats = match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!("Telemetry sampler task ended abnormally: {}", e);
                    SamplerStats::default()
                }
            },
            None => SamplerStats::default(),
        };
        info!(
            "Telemetry sampler stopped: {} samples, {} failed ticks",
            stats.samples_written, stats.failed_ticks
        );
        stats
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for TelemetrySampler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn sample_loop(
    monitor: Arc<dyn GpuMonitor>,
    log: TelemetryLog,
    interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> SamplerStats {
    let mut stats = SamplerStats::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        let snapshot = tokio::select! {
            _ = &mut shutdown => break,
            snapshot = monitor.query() => snapshot,
        };

        match snapshot {
            Ok(snapshot) => {
                let sample = TelemetrySample::new(Utc::now(), snapshot);
                match log.append(&sample) {
                    Ok(()) => {
                        stats.samples_written += 1;
                        debug!(
                            "GPU sample: mem={}MiB util={}% power={}W temp={}C",
                            sample.memory_used,
                            sample.utilization_pct,
                            sample.power_draw,
                            sample.temperature
                        );
                    }
                    Err(e) => {
                        stats.failed_ticks += 1;
                        warn!("Failed to append telemetry sample: {}", e);
                    }
                }
            }
            Err(e) => {
                stats.failed_ticks += 1;
                warn!("Skipping telemetry tick: {}", e);
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    struct CountingMonitor {
        calls: AtomicU64,
    }

    #[async_trait]
    impl GpuMonitor for CountingMonitor {
        async fn query(&self) -> Result<GpuSnapshot> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 1 {
                return Err(BenchError::Telemetry("flaky".to_string()));
            }
            Ok(GpuSnapshot {
                memory_used: 1000.0 + n as f64,
                memory_total: 24576.0,
                utilization_pct: 50.0,
                power_draw: 120.5,
                temperature: 60.0,
            })
        }
    }

    fn sample_at(ts: &str) -> TelemetrySample {
        TelemetrySample {
            timestamp: DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc),
            memory_used: 2048.0,
            memory_total: 8192.0,
            utilization_pct: 97.0,
            power_draw: 250.25,
            temperature: 71.0,
        }
    }

    #[test]
    fn test_line_encoding() {
        let sample = sample_at("2024-05-01T12:00:00.250Z");
        let line = sample.to_line();
        assert_eq!(line, "2024-05-01T12:00:00.250Z,2048,8192,97,250.25,71\n");
        assert_eq!(TelemetrySample::from_line(&line), Some(sample));
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert_eq!(TelemetrySample::from_line(""), None);
        assert_eq!(TelemetrySample::from_line("not a sample"), None);
        assert_eq!(TelemetrySample::from_line("2024-05-01T12:00:00Z,1,2,3,4"), None);
        assert_eq!(TelemetrySample::from_line("2024-05-01T12:00:00Z,1,2,3,4,5,6"), None);
        assert_eq!(TelemetrySample::from_line("2024-05-01T12:00:00Z,1,2,[N/A],4,5"), None);
    }

    #[test]
    fn test_parse_nvidia_smi_row() {
        let snapshot = parse_nvidia_smi_row("5120, 24576, 87, 215.43, 66").unwrap();
        assert_eq!(snapshot.memory_used, 5120.0);
        assert_eq!(snapshot.memory_total, 24576.0);
        assert_eq!(snapshot.utilization_pct, 87.0);
        assert_eq!(snapshot.power_draw, 215.43);
        assert_eq!(snapshot.temperature, 66.0);

        assert!(parse_nvidia_smi_row("5120, 24576, 87, [N/A], 66").is_err());
        assert!(parse_nvidia_smi_row("5120, 24576").is_err());
    }

    #[test]
    fn test_log_skips_partial_trailing_line() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::open(dir.path().join("telemetry.log")).unwrap();
        log.append(&sample_at("2024-05-01T12:00:00Z")).unwrap();
        log.append(&sample_at("2024-05-01T12:00:01Z")).unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"2024-05-01T12:00:02.000Z,20").unwrap();

        let samples = log.read_samples().unwrap();
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let log = TelemetryLog {
            path: PathBuf::from("/nonexistent/fleece/telemetry.log"),
        };
        assert!(log.read_samples().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sampler_survives_failed_ticks() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::open(dir.path().join("telemetry.log")).unwrap();
        let monitor = Arc::new(CountingMonitor {
            calls: AtomicU64::new(0),
        });

        let sampler =
            TelemetrySampler::start(monitor.clone(), log.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sampler.is_running());
        let stats = sampler.stop().await;

        assert!(stats.samples_written >= 2);
        assert!(stats.failed_ticks >= 1);
        assert_eq!(log.read_samples().unwrap().len() as u64, stats.samples_written);
    }

    #[tokio::test]
    async fn test_dropped_sampler_is_aborted() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::open(dir.path().join("telemetry.log")).unwrap();
        let monitor = Arc::new(CountingMonitor {
            calls: AtomicU64::new(0),
        });

        let sampler = TelemetrySampler::start(monitor.clone(), log, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(sampler);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let after_drop = monitor.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(monitor.calls.load(Ordering::SeqCst), after_drop);
    }
}
