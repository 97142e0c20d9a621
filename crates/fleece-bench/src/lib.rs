//! Fleece benchmarking harness
//!
//! This crate drives an external inference engine across a matrix of
//! (model × prompt × repeat) cells while sampling GPU telemetry, and reduces
//! the noisy per-run counters to summary statistics:
//! - Duration parsing and transcript metric extraction
//! - Background GPU telemetry sampling into an append-only log
//! - Correlation of telemetry samples with each run's wall-clock window
//! - Grouped descriptive statistics with a high-variance flag
//! - Session orchestration with warmup, resume and fresh-mode policies

pub mod correlate;
pub mod duration;
pub mod engine;
pub mod error;
pub mod extract;
pub mod record;
pub mod report;
pub mod runlog;
pub mod session;
pub mod stats;
pub mod telemetry;

pub use correlate::{correlate, WindowStats};
pub use duration::{format_duration, parse_duration};
pub use engine::{CommandEngine, EngineOutput, InferenceEngine, InvocationRequest};
pub use error::{BenchError, Result};
pub use extract::{extract_metrics, extract_metrics_from_file, MetricRecord};
pub use record::{BenchMode, RunRecord};
pub use session::{
    is_artifact_complete, CellState, PlannedCell, PromptSpec, Session, SessionConfig, SessionEvent,
    SessionOutcome, SessionPaths,
};
pub use stats::{
    aggregate, describe, rollup, summarize, FieldStats, GroupKey, StatField, SummaryRow,
};
pub use telemetry::{
    GpuMonitor, GpuSnapshot, NvidiaSmiMonitor, SamplerStats, TelemetryLog, TelemetrySample,
    TelemetrySampler,
};
