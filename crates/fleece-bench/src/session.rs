//! Benchmark session orchestration
//!
//! A [`Session`] walks the (model × prompt × repeat) matrix one cell at a
//! time. Each cell is either SKIPPED, when resume is on and a complete
//! transcript already exists, or RUNNING → COMPLETED. The telemetry sampler
//! runs for the whole session and is torn down on every exit path.

use crate::engine::{InferenceEngine, InvocationRequest};
use crate::extract::{
    extract_metrics, extract_metrics_from_file, has_completion_markers, PARSE_COLLISION_WARNING,
};
use crate::record::{
    BenchMode, RunRecord, WARN_EMPTY_TRANSCRIPT, WARN_ENGINE_ERROR, WARN_ENGINE_TIMEOUT,
    WARN_NO_TELEMETRY,
};
use crate::report::{read_results_csv, write_summary_csv, ResultsWriter};
use crate::runlog::{EnvironmentSnapshot, RunLog};
use crate::stats::{summarize, SummaryRow, ALL_GROUP};
use crate::telemetry::{GpuMonitor, SamplerStats, TelemetryLog, TelemetrySampler};
use crate::{BenchError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A prompt in the matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSpec {
    pub id: String,
    pub text: String,
}

impl PromptSpec {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Fully resolved inputs of one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub models: Vec<String>,
    pub prompts: Vec<PromptSpec>,
    /// Text prepended to every prompt
    pub document: Option<String>,
    pub repeats: u32,
    /// Unrecorded invocations per model before its first repeat
    pub warmup: u32,
    pub mode: BenchMode,
    pub resume: bool,
    pub output_dir: PathBuf,
    pub telemetry_interval: Duration,
    /// `None` waits for the engine indefinitely
    pub invocation_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            prompts: Vec::new(),
            document: None,
            repeats: 3,
            warmup: 1,
            mode: BenchMode::Steady,
            resume: false,
            output_dir: PathBuf::from("./bench_results"),
            telemetry_interval: Duration::from_millis(500),
            invocation_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Reject configurations that cannot form a matrix
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(BenchError::config("no models configured"));
        }
        if self.prompts.is_empty() {
            return Err(BenchError::config("no prompts configured"));
        }
        if self.repeats == 0 {
            return Err(BenchError::config("repeats must be at least 1"));
        }
        if self.telemetry_interval.is_zero() {
            return Err(BenchError::config("telemetry interval must be positive"));
        }
        let mut model_dirs = BTreeSet::new();
        for model in &self.models {
            if model.trim().is_empty() {
                return Err(BenchError::config("model with empty name"));
            }
            if !model_dirs.insert(slug(model).to_ascii_lowercase()) {
                return Err(BenchError::config(format!(
                    "model '{}' is listed twice or shares a transcript directory",
                    model
                )));
            }
        }
        let mut prompt_files = BTreeSet::new();
        for prompt in &self.prompts {
            if prompt.id.trim().is_empty() {
                return Err(BenchError::config("prompt with empty id"));
            }
            if prompt.id.eq_ignore_ascii_case(ALL_GROUP) {
                return Err(BenchError::config(format!(
                    "prompt id '{}' is reserved for per-model rollups",
                    prompt.id
                )));
            }
            if !prompt_files.insert(slug(&prompt.id).to_ascii_lowercase()) {
                return Err(BenchError::config(format!(
                    "prompt id '{}' is listed twice or shares a transcript name",
                    prompt.id
                )));
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "models={:?} prompts={:?} repeats={} warmup={} mode={} resume={} document={}",
            self.models,
            self.prompts.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            self.repeats,
            self.warmup,
            self.mode,
            self.resume,
            self.document.is_some()
        )
    }
}

/// File locations inside an output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub transcripts: PathBuf,
    pub results_csv: PathBuf,
    pub summary_csv: PathBuf,
    pub telemetry_log: PathBuf,
    pub run_log: PathBuf,
}

impl SessionPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            transcripts: root.join("transcripts"),
            results_csv: root.join("results.csv"),
            summary_csv: root.join("summary.csv"),
            telemetry_log: root.join("telemetry.log"),
            run_log: root.join("run.log"),
            root,
        }
    }

    fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.transcripts)?;
        Ok(())
    }

    /// Transcript location of one cell
    pub fn artifact(&self, model: &str, prompt_id: &str, mode: BenchMode, repeat: u32) -> PathBuf {
        self.transcripts
            .join(slug(model))
            .join(format!("{}__{}__r{:02}.txt", slug(prompt_id), mode, repeat))
    }
}

/// Filesystem-safe form of an identifier.
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-encoded, as is a leading `.`,
/// so distinct identifiers never share a path component.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// A transcript is complete when it is non-empty and carries both completion markers
pub fn is_artifact_complete(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(text) => !text.trim().is_empty() && has_completion_markers(&text),
        Err(_) => false,
    }
}

/// Lifecycle of one matrix cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Pending,
    Skipped,
    Running,
    Completed,
}

impl fmt::Display for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Skipped => "SKIPPED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// One (model, prompt, repeat) combination and its resume decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCell {
    pub model: String,
    pub prompt_id: String,
    pub repeat_index: u32,
    pub artifact: PathBuf,
    /// First transition out of PENDING
    pub next_state: CellState,
}

/// Progress notifications emitted while a session runs
#[derive(Debug)]
pub enum SessionEvent<'a> {
    Warmup {
        model: &'a str,
        iteration: u32,
        eval_rate: Option<f64>,
    },
    CellFinished {
        record: &'a RunRecord,
        index: usize,
        total: usize,
    },
}

type ProgressFn = Box<dyn Fn(&SessionEvent<'_>) + Send + Sync>;

/// Everything a finished session produced
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub records: Vec<RunRecord>,
    pub summary: Vec<SummaryRow>,
    pub sampler: SamplerStats,
    pub paths: SessionPaths,
}

/// Orchestrates one benchmark session
pub struct Session {
    config: SessionConfig,
    engine: Arc<dyn InferenceEngine>,
    monitor: Arc<dyn GpuMonitor>,
    progress: Option<ProgressFn>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        engine: Arc<dyn InferenceEngine>,
        monitor: Arc<dyn GpuMonitor>,
    ) -> Self {
        Self {
            config,
            engine,
            monitor,
            progress: None,
        }
    }

    /// Register a progress callback
    pub fn with_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&SessionEvent<'_>) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn paths(&self) -> SessionPaths {
        SessionPaths::new(&self.config.output_dir)
    }

    /// Enumerate the matrix in execution order with each cell's resume decision
    pub fn plan(&self) -> Vec<PlannedCell> {
        let paths = self.paths();
        let mut cells = Vec::new();
        for model in &self.config.models {
            for prompt in &self.config.prompts {
                for repeat in 1..=self.config.repeats {
                    let artifact = paths.artifact(model, &prompt.id, self.config.mode, repeat);
                    let next_state = if self.config.resume && is_artifact_complete(&artifact) {
                        CellState::Skipped
                    } else {
                        CellState::Running
                    };
                    cells.push(PlannedCell {
                        model: model.clone(),
                        prompt_id: prompt.id.clone(),
                        repeat_index: repeat,
                        artifact,
                        next_state,
                    });
                }
            }
        }
        cells
    }

    /// Run the whole matrix.
    ///
    /// Configuration errors are returned before the sampler starts. Once
    /// running, per-cell failures are recorded on the records and the
    /// session always produces complete results and summary tables.
    pub async fn run(&self) -> Result<SessionOutcome> {
        self.config.validate()?;

        let paths = self.paths();
        paths.prepare()?;

        let mut run_log = RunLog::open(&paths.run_log)?;
        let mut env = EnvironmentSnapshot::capture();
        env.engine_version = self.engine.version().await;
        env.gpu = self.monitor.describe().await;
        run_log.session_started(self.config.resume, &self.config.describe(), &env);
        info!("Starting benchmark session: {}", self.config.describe());

        let telemetry = TelemetryLog::open(&paths.telemetry_log)?;
        let sampler = TelemetrySampler::start(
            Arc::clone(&self.monitor),
            telemetry.clone(),
            self.config.telemetry_interval,
        );

        let matrix = self.run_matrix(&paths, &telemetry, &mut run_log).await;
        let sampler_stats = sampler.stop().await;
        let records = matrix?;

        let summary = summarize(&records);
        write_summary_csv(&paths.summary_csv, &summary)?;
        run_log.session_finished(&records, sampler_stats);
        info!(
            "Session complete: {} records, {} summary rows",
            records.len(),
            summary.len()
        );

        Ok(SessionOutcome {
            records,
            summary,
            sampler: sampler_stats,
            paths,
        })
    }

    async fn run_matrix(
        &self,
        paths: &SessionPaths,
        telemetry: &TelemetryLog,
        run_log: &mut RunLog,
    ) -> Result<Vec<RunRecord>> {
        let plan = self.plan();
        let total = plan.len();
        let prior = if self.config.resume {
            previous_results(&paths.results_csv)
        } else {
            BTreeMap::new()
        };
        if !prior.is_empty() {
            run_log.line(&format!(
                "carrying over {} rows from the previous results table",
                prior.len()
            ));
        }
        let mut results = ResultsWriter::create(&paths.results_csv)?;
        let mut records = Vec::with_capacity(total);
        let mut warmed: BTreeSet<String> = BTreeSet::new();

        for (index, cell) in plan.iter().enumerate() {
            if cell.next_state == CellState::Running && warmed.insert(cell.model.clone()) {
                self.warmup(&cell.model, run_log).await;
            }

            let record = if cell.next_state == CellState::Skipped {
                let key = (cell.model.clone(), cell.prompt_id.clone(), cell.repeat_index);
                skipped_record(cell, self.config.mode, prior.get(&key))
            } else {
                self.run_cell(cell, telemetry).await
            };

            if let Err(e) = results.write(&record) {
                warn!("Failed to append results row: {}", e);
            }
            run_log.cell(&record);
            self.emit(&SessionEvent::CellFinished {
                record: &record,
                index,
                total,
            });
            records.push(record);
        }

        Ok(records)
    }

    async fn warmup(&self, model: &str, run_log: &mut RunLog) {
        let Some(prompt) = self.config.prompts.first() else {
            return;
        };

        for iteration in 1..=self.config.warmup {
            if self.config.mode == BenchMode::Fresh {
                self.unload(model).await;
            }
            let request =
                InvocationRequest::new(model, &prompt.text, self.config.document.as_deref());
            let eval_rate = match self.invoke(&request).await {
                Ok(output) => extract_metrics(&output.transcript).eval_rate,
                Err(e) => {
                    warn!("Warmup {} #{} failed: {}", model, iteration, e);
                    None
                }
            };
            match eval_rate {
                Some(rate) => info!("Warmup {} #{}: {:.2} tokens/s", model, iteration, rate),
                None => info!("Warmup {} #{}: no eval rate", model, iteration),
            }
            run_log.warmup(model, iteration, eval_rate);
            self.emit(&SessionEvent::Warmup {
                model,
                iteration,
                eval_rate,
            });
        }
    }

    async fn run_cell(&self, cell: &PlannedCell, telemetry: &TelemetryLog) -> RunRecord {
        let mode = self.config.mode;
        let mut warnings = BTreeSet::new();

        debug!(
            "{} r{} {}: {} -> {}",
            cell.model,
            cell.repeat_index,
            cell.prompt_id,
            CellState::Pending,
            cell.next_state
        );

        if mode == BenchMode::Fresh {
            self.unload(&cell.model).await;
        }

        let prompt_text = self
            .config
            .prompts
            .iter()
            .find(|p| p.id == cell.prompt_id)
            .map(|p| p.text.as_str())
            .unwrap_or_default();
        let document = self.config.document.as_deref();
        let request = InvocationRequest::new(cell.model.as_str(), prompt_text, document);

        let run_start = Utc::now();
        let outcome = self.invoke(&request).await;
        let run_end = Utc::now();
        debug!(
            "{} r{} {}: {} -> {}",
            cell.model,
            cell.repeat_index,
            cell.prompt_id,
            CellState::Running,
            CellState::Completed
        );

        let (transcript, exit_code) = match outcome {
            Ok(output) => (output.transcript, output.exit_code),
            Err(BenchError::Timeout(limit)) => {
                warn!(
                    "{} / {} r{} timed out after {:?}",
                    cell.model, cell.prompt_id, cell.repeat_index, limit
                );
                warnings.insert(WARN_ENGINE_TIMEOUT.to_string());
                (String::new(), None)
            }
            Err(e) => {
                warn!("{} / {} r{} failed: {}", cell.model, cell.prompt_id, cell.repeat_index, e);
                warnings.insert(WARN_ENGINE_ERROR.to_string());
                (String::new(), None)
            }
        };

        if let Some(code) = exit_code.filter(|c| *c != 0) {
            warn!("{} exited with status {}", cell.model, code);
            warnings.insert(format!("engine_exit_status={}", code));
        }
        if transcript.trim().is_empty() {
            warnings.insert(WARN_EMPTY_TRANSCRIPT.to_string());
        }

        if let Err(e) = persist_transcript(&cell.artifact, &transcript) {
            warn!("Failed to save transcript {}: {}", cell.artifact.display(), e);
        }

        let metrics = extract_metrics(&transcript);
        if metrics.possible_parse_collision() {
            warn!(
                "Prompt and generation counters are identical for {} / {} r{}",
                cell.model, cell.prompt_id, cell.repeat_index
            );
            warnings.insert(PARSE_COLLISION_WARNING.to_string());
        }

        let gpu = telemetry.window(run_start, run_end);
        if gpu.is_empty() {
            warnings.insert(WARN_NO_TELEMETRY.to_string());
        }

        RunRecord {
            model: cell.model.clone(),
            prompt_id: cell.prompt_id.clone(),
            repeat_index: cell.repeat_index,
            mode,
            run_start: Some(run_start),
            run_end: Some(run_end.max(run_start)),
            exit_code,
            metrics,
            gpu,
            ran_this_time: true,
            parse_warnings: warnings,
        }
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<crate::engine::EngineOutput> {
        match self.config.invocation_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.engine.invoke(request)).await {
                Ok(result) => result,
                Err(_) => Err(BenchError::Timeout(limit)),
            },
            None => self.engine.invoke(request).await,
        }
    }

    async fn unload(&self, model: &str) {
        if let Err(e) = self.engine.unload(model).await {
            debug!("Ignoring unload failure for {}: {}", model, e);
        }
    }

    fn emit(&self, event: &SessionEvent<'_>) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }
}

type ResultKey = (String, String, u32);

/// Rows of an earlier session's results table in the current mode, keyed by cell
fn previous_results(path: &Path) -> BTreeMap<ResultKey, RunRecord> {
    if !path.exists() {
        return BTreeMap::new();
    }
    match read_results_csv(path) {
        Ok(records) => records
            .into_iter()
            .map(|r| ((r.model.clone(), r.prompt_id.clone(), r.repeat_index), r))
            .collect(),
        Err(e) => {
            warn!("Ignoring unreadable results table {}: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

/// Record of a cell whose complete transcript came from an earlier session.
///
/// Metrics are re-extracted from the transcript. Exit code, GPU window and
/// warnings come from the earlier results row when it exists for the same mode.
fn skipped_record(cell: &PlannedCell, mode: BenchMode, prior: Option<&RunRecord>) -> RunRecord {
    let metrics = extract_metrics_from_file(&cell.artifact);
    let prior = prior.filter(|p| p.mode == mode);

    let mut warnings = prior.map(|p| p.parse_warnings.clone()).unwrap_or_default();
    if metrics.possible_parse_collision() {
        warnings.insert(PARSE_COLLISION_WARNING.to_string());
    }
    info!(
        "Skipping {} / {} r{}: complete transcript exists",
        cell.model, cell.prompt_id, cell.repeat_index
    );

    RunRecord {
        model: cell.model.clone(),
        prompt_id: cell.prompt_id.clone(),
        repeat_index: cell.repeat_index,
        mode,
        run_start: None,
        run_end: None,
        exit_code: prior.and_then(|p| p.exit_code),
        metrics,
        gpu: prior.map(|p| p.gpu).unwrap_or_default(),
        ran_this_time: false,
        parse_warnings: warnings,
    }
}

fn persist_transcript(path: &Path, transcript: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, transcript)
}
