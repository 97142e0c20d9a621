//! Summarize command implementation
//!
//! Recomputes grouped statistics from a persisted results table without
//! invoking the engine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use console::style;
use fleece_bench::report::{read_results_csv, write_summary_csv};
use fleece_bench::stats::{ALL_GROUP, PRIMARY_RATE};
use fleece_bench::{summarize, GroupKey, StatField, SummaryRow};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tabled::{settings::Style, Table, Tabled};
use tracing::{debug, info};

use crate::commands::Command;
use crate::config::Config;
use crate::utils::{format_optional, print_json, print_success};

#[derive(Args, Debug)]
pub struct SummarizeCommand {
    /// Results table written by `fleece run`
    pub results: PathBuf,

    /// Also write the summary table to this CSV file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Hide the per-model rollup rows
    #[arg(long)]
    pub no_rollup: bool,
}

#[derive(Tabled)]
struct SummaryLine {
    model: String,
    mode: String,
    prompt: String,
    runs: usize,
    #[tabled(rename = "eval tok/s")]
    eval_rate: String,
    stddev: String,
    #[tabled(rename = "cv %")]
    cv_pct: String,
    #[tabled(rename = "gpu util %")]
    gpu_util: String,
    #[tabled(rename = "gpu W")]
    gpu_power: String,
    #[tabled(rename = "high variance")]
    high_variance: String,
}

impl From<&SummaryRow> for SummaryLine {
    fn from(row: &SummaryRow) -> Self {
        let group = |key| row.group_value(key).unwrap_or_default().to_string();
        let rate = row.stat(PRIMARY_RATE);
        Self {
            model: group(GroupKey::Model),
            mode: group(GroupKey::Mode),
            prompt: group(GroupKey::Prompt),
            runs: row.runs,
            eval_rate: format_optional(rate.map(|s| s.mean), 2),
            stddev: format_optional(rate.map(|s| s.stddev), 2),
            cv_pct: format_optional(rate.and_then(|s| s.cv_pct), 1),
            gpu_util: format_optional(row.stat(StatField::GpuUtilMean).map(|s| s.mean), 1),
            gpu_power: format_optional(row.stat(StatField::GpuPowerMean).map(|s| s.mean), 1),
            high_variance: if row.high_variance { "YES".to_string() } else { String::new() },
        }
    }
}

#[async_trait]
impl Command for SummarizeCommand {
    async fn execute(&self, _config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing summarize command: {:?}", self);

        let records = read_results_csv(&self.results)
            .with_context(|| format!("Failed to read results table: {}", self.results.display()))?;
        info!("Loaded {} records from {}", records.len(), self.results.display());

        let mut rows = summarize(&records);

        if let Some(output) = &self.output {
            write_summary_csv(output, &rows)
                .with_context(|| format!("Failed to write summary: {}", output.display()))?;
        }

        if self.no_rollup {
            rows.retain(|row| !is_rollup(row));
        }

        if json_output {
            let data = json!({
                "source": self.results.display().to_string(),
                "records": records.len(),
                "summary": summary_json(&rows),
            });
            print_json(&data)?;
        } else {
            println!("{}", style(format!("Summary of {} records", records.len())).bold().cyan());
            print_summary_table(&rows);
            if let Some(output) = &self.output {
                print_success(&format!("Summary written to {}", output.display()));
            }
        }

        Ok(())
    }
}

fn is_rollup(row: &SummaryRow) -> bool {
    row.group_value(GroupKey::Prompt) == Some(ALL_GROUP)
}

/// Print summary rows as a table
pub fn print_summary_table(rows: &[SummaryRow]) {
    if rows.is_empty() {
        println!("(no records)");
        return;
    }
    let lines: Vec<SummaryLine> = rows.iter().map(SummaryLine::from).collect();
    let mut table = Table::new(lines);
    table.with(Style::rounded());
    println!("{}", table);

    let flagged = rows.iter().filter(|r| r.high_variance && !is_rollup(r)).count();
    if flagged > 0 {
        println!(
            "{} {} group(s) exceed the coefficient-of-variation threshold",
            style("!").yellow().bold(),
            flagged
        );
    }
}

/// JSON view of summary rows keyed by column names
pub fn summary_json(rows: &[SummaryRow]) -> Value {
    let rows = rows
        .iter()
        .map(|row| {
            let mut obj = Map::new();
            for (key, value) in &row.group {
                obj.insert(key.name().to_string(), json!(value));
            }
            obj.insert("runs".to_string(), json!(row.runs));
            for (field, stats) in &row.stats {
                let value = match stats {
                    Some(s) => json!({
                        "n": s.count,
                        "mean": s.mean,
                        "stddev": s.stddev,
                        "min": s.min,
                        "max": s.max,
                        "median": s.median,
                        "cv_pct": s.cv_pct,
                    }),
                    None => Value::Null,
                };
                obj.insert(field.name().to_string(), value);
            }
            obj.insert("high_variance".to_string(), json!(row.high_variance));
            Value::Object(obj)
        })
        .collect();
    Value::Array(rows)
}
