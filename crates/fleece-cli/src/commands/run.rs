//! Run command implementation
//!
//! Executes a full benchmark session against the configured engine and GPU.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use console::style;
use fleece_bench::{Session, SessionConfig, SessionEvent};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::commands::summarize::{print_summary_table, summary_json};
use crate::commands::Command;
use crate::config::{Config, Overrides};
use crate::utils::{
    create_progress_bar, format_rate, format_seconds, print_json, print_success, print_warning,
};

/// Matrix selection shared by `run` and `status`
#[derive(Args, Debug, Clone, Default)]
pub struct MatrixArgs {
    /// Model to benchmark (repeatable; replaces the configured list)
    #[arg(short, long = "model")]
    pub models: Vec<String>,

    /// Inline prompt as ID=TEXT (repeatable; replaces the configured list)
    #[arg(short, long = "prompt", value_parser = parse_prompt)]
    pub prompts: Vec<(String, String)>,

    /// Text file prepended to every prompt
    #[arg(long)]
    pub document: Option<PathBuf>,

    /// Recorded repeats per model and prompt
    #[arg(short = 'n', long)]
    pub repeats: Option<u32>,

    /// Unload the model before every invocation
    #[arg(long)]
    pub fresh: bool,

    /// Output directory
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
}

impl MatrixArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            models: self.models.clone(),
            prompts: self.prompts.clone(),
            document: self.document.clone(),
            repeats: self.repeats,
            fresh: self.fresh,
            output_dir: self.output_dir.clone(),
            ..Default::default()
        }
    }
}

fn parse_prompt(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((id, text)) if !id.trim().is_empty() => Ok((id.trim().to_string(), text.to_string())),
        _ => Err(format!("expected ID=TEXT, got '{}'", value)),
    }
}

#[derive(Args, Debug)]
pub struct RunCommand {
    #[command(flatten)]
    pub matrix: MatrixArgs,

    /// Unrecorded warmup invocations per model
    #[arg(long)]
    pub warmup: Option<u32>,

    /// Skip cells whose transcript is already complete
    #[arg(long)]
    pub resume: bool,

    /// Per-invocation timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[async_trait]
impl Command for RunCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing run command: {:?}", self);

        let mut overrides = self.matrix.overrides();
        overrides.warmup = self.warmup;
        overrides.resume = self.resume;
        overrides.timeout_secs = self.timeout;

        let config = config.merged(&overrides);
        let session_config = config.to_session_config()?;
        let engine = Arc::new(config.engine()?);
        let monitor = Arc::new(config.monitor()?);

        let total = planned_cells(&session_config);
        info!("Benchmarking {} cells into {}", total, session_config.output_dir.display());

        let pb = create_progress_bar(total as u64, "starting");
        if json_output {
            pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        }
        let progress = pb.clone();

        let on_event = move |event: &SessionEvent<'_>| match event {
            SessionEvent::Warmup {
                model,
                iteration,
                eval_rate,
            } => {
                progress.set_message(format!(
                    "warmup {} #{}: {}",
                    model,
                    iteration,
                    format_rate(*eval_rate)
                ));
            }
            SessionEvent::CellFinished { record, .. } => {
                progress.inc(1);
                let status = if record.ran_this_time { "done" } else { "skipped" };
                progress.set_message(format!(
                    "{} {} r{} {}: {}",
                    record.model,
                    record.prompt_id,
                    record.repeat_index,
                    status,
                    format_rate(record.metrics.eval_rate)
                ));
            }
        };
        let session = Session::new(session_config, engine, monitor).with_progress(on_event);

        let outcome = tokio::select! {
            outcome = session.run() => outcome.context("Benchmark session failed")?,
            _ = tokio::signal::ctrl_c() => {
                pb.abandon_with_message("interrupted");
                anyhow::bail!("Interrupted; rerun with --resume to pick up where it stopped");
            }
        };
        pb.finish_with_message("complete");

        let ran: Vec<_> = outcome.records.iter().filter(|r| r.ran_this_time).collect();
        let flagged = outcome.records.iter().filter(|r| !r.parse_warnings.is_empty()).count();
        let wall: f64 = ran.iter().filter_map(|r| r.wall_seconds()).sum();

        if json_output {
            let data = json!({
                "output_dir": outcome.paths.root.display().to_string(),
                "records": outcome.records.len(),
                "ran": ran.len(),
                "skipped": outcome.records.len() - ran.len(),
                "with_warnings": flagged,
                "telemetry_samples": outcome.sampler.samples_written,
                "telemetry_failed_ticks": outcome.sampler.failed_ticks,
                "summary": summary_json(&outcome.summary),
            });
            print_json(&data)?;
            return Ok(());
        }

        println!();
        println!("{}", style("Benchmark Summary").bold().cyan());
        print_summary_table(&outcome.summary);
        println!(
            "{} runs in {}, {} skipped, {} telemetry samples",
            ran.len(),
            format_seconds(wall),
            outcome.records.len() - ran.len(),
            outcome.sampler.samples_written
        );
        if flagged > 0 {
            print_warning(&format!(
                "{} record(s) carry warnings; see {}",
                flagged,
                outcome.paths.results_csv.display()
            ));
        }
        if outcome.sampler.samples_written == 0 {
            print_warning("No GPU telemetry was collected; is nvidia-smi available?");
        }
        print_success(&format!("Results written to {}", outcome.paths.root.display()));

        Ok(())
    }
}

fn planned_cells(config: &SessionConfig) -> usize {
    config.models.len() * config.prompts.len() * config.repeats as usize
}
