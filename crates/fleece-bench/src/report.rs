//! CSV output for raw results and summaries

use crate::correlate::WindowStats;
use crate::extract::MetricRecord;
use crate::record::{BenchMode, RunRecord};
use crate::stats::{GroupKey, StatField, SummaryRow};
use crate::{BenchError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use csv::StringRecord;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Column set of the raw results table
pub const RESULT_COLUMNS: &[&str] = &[
    "model",
    "prompt_id",
    "repeat_index",
    "mode",
    "run_start",
    "run_end",
    "wall_seconds",
    "exit_code",
    "total_duration_s",
    "load_duration_s",
    "prompt_eval_count",
    "prompt_eval_duration_s",
    "prompt_eval_rate_tps",
    "eval_count",
    "eval_duration_s",
    "eval_rate_tps",
    "gpu_mem_max_mib",
    "gpu_mem_min_mib",
    "gpu_util_max_pct",
    "gpu_util_mean_pct",
    "gpu_power_max_w",
    "gpu_power_mean_w",
    "gpu_temp_max_c",
    "gpu_sample_count",
    "ran_this_time",
    "parse_warnings",
];

const STAT_SUFFIXES: &[&str] = &["n", "mean", "stddev", "min", "max", "median", "cv_pct"];

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn opt_time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn fixed(value: f64) -> String {
    format!("{:.3}", value)
}

fn result_row(record: &RunRecord) -> Vec<String> {
    let m = &record.metrics;
    let g = &record.gpu;
    vec![
        record.model.clone(),
        record.prompt_id.clone(),
        record.repeat_index.to_string(),
        record.mode.to_string(),
        opt_time(record.run_start),
        opt_time(record.run_end),
        opt(record.wall_seconds()),
        opt(record.exit_code),
        opt(m.total_duration),
        opt(m.load_duration),
        opt(m.prompt_eval_count),
        opt(m.prompt_eval_duration),
        opt(m.prompt_eval_rate),
        opt(m.eval_count),
        opt(m.eval_duration),
        opt(m.eval_rate),
        opt(g.mem_max),
        opt(g.mem_min),
        opt(g.util_max),
        opt(g.util_mean),
        opt(g.power_max),
        opt(g.power_mean),
        opt(g.temp_max),
        g.sample_count.to_string(),
        record.ran_this_time.to_string(),
        record.warnings_joined(),
    ]
}

/// Incremental writer for the raw results table. Each row is flushed as it is written.
pub struct ResultsWriter<W: Write> {
    wtr: csv::Writer<W>,
}

impl ResultsWriter<File> {
    /// Create (truncating) the results file at `path`
    pub fn create(path: &Path) -> Result<Self> {
        Self::new(File::create(path)?)
    }
}

impl<W: Write> ResultsWriter<W> {
    pub fn new(writer: W) -> Result<Self> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(RESULT_COLUMNS)?;
        wtr.flush()?;
        Ok(Self { wtr })
    }

    pub fn write(&mut self, record: &RunRecord) -> Result<()> {
        self.wtr.write_record(result_row(record))?;
        self.wtr.flush()?;
        Ok(())
    }
}

struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn new(headers: &StringRecord) -> Result<Self> {
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_string(), i))
            .collect();
        for required in ["model", "prompt_id", "repeat_index"] {
            if !index.contains_key(required) {
                return Err(BenchError::config(format!(
                    "results table has no '{}' column",
                    required
                )));
            }
        }
        Ok(Self { index })
    }

    fn raw<'r>(&self, row: &'r StringRecord, name: &str) -> Option<&'r str> {
        let i = *self.index.get(name)?;
        row.get(i).map(str::trim).filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, row: &StringRecord, name: &str) -> Option<T> {
        self.raw(row, name)?.parse().ok()
    }

    fn time(&self, row: &StringRecord, name: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.raw(row, name)?)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Read a results table written by [`ResultsWriter`]. Columns are matched by name.
pub fn read_results_csv(path: &Path) -> Result<Vec<RunRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let columns = Columns::new(rdr.headers()?)?;

    let mut records = Vec::new();
    for row in rdr.records() {
        let row = row?;
        let c = &columns;
        records.push(RunRecord {
            model: c.raw(&row, "model").unwrap_or_default().to_string(),
            prompt_id: c.raw(&row, "prompt_id").unwrap_or_default().to_string(),
            repeat_index: c.parse(&row, "repeat_index").unwrap_or_default(),
            mode: c.parse::<BenchMode>(&row, "mode").unwrap_or_default(),
            run_start: c.time(&row, "run_start"),
            run_end: c.time(&row, "run_end"),
            exit_code: c.parse(&row, "exit_code"),
            metrics: MetricRecord {
                total_duration: c.parse(&row, "total_duration_s"),
                load_duration: c.parse(&row, "load_duration_s"),
                prompt_eval_count: c.parse(&row, "prompt_eval_count"),
                prompt_eval_duration: c.parse(&row, "prompt_eval_duration_s"),
                prompt_eval_rate: c.parse(&row, "prompt_eval_rate_tps"),
                eval_count: c.parse(&row, "eval_count"),
                eval_duration: c.parse(&row, "eval_duration_s"),
                eval_rate: c.parse(&row, "eval_rate_tps"),
            },
            gpu: WindowStats {
                mem_max: c.parse(&row, "gpu_mem_max_mib"),
                mem_min: c.parse(&row, "gpu_mem_min_mib"),
                util_max: c.parse(&row, "gpu_util_max_pct"),
                util_mean: c.parse(&row, "gpu_util_mean_pct"),
                power_max: c.parse(&row, "gpu_power_max_w"),
                power_mean: c.parse(&row, "gpu_power_mean_w"),
                temp_max: c.parse(&row, "gpu_temp_max_c"),
                sample_count: c.parse(&row, "gpu_sample_count").unwrap_or_default(),
            },
            ran_this_time: c.parse(&row, "ran_this_time").unwrap_or(true),
            parse_warnings: c
                .raw(&row, "parse_warnings")
                .map(|w| {
                    w.split(';')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(BTreeSet::new),
        });
    }

    Ok(records)
}

/// Header for a summary table with the given group keys
pub fn summary_header(keys: &[GroupKey]) -> Vec<String> {
    let mut header: Vec<String> = keys.iter().map(|k| k.name().to_string()).collect();
    header.push("runs".to_string());
    for field in StatField::ALL {
        for suffix in STAT_SUFFIXES {
            header.push(format!("{}_{}", field.name(), suffix));
        }
    }
    header.push("high_variance".to_string());
    header
}

fn summary_row(row: &SummaryRow) -> Vec<String> {
    let mut out: Vec<String> = row.group.iter().map(|(_, v)| v.clone()).collect();
    out.push(row.runs.to_string());
    for field in StatField::ALL {
        match row.stat(*field) {
            Some(s) => {
                out.push(s.count.to_string());
                out.push(fixed(s.mean));
                out.push(fixed(s.stddev));
                out.push(fixed(s.min));
                out.push(fixed(s.max));
                out.push(fixed(s.median));
                out.push(s.cv_pct.map(fixed).unwrap_or_default());
            }
            None => {
                out.push("0".to_string());
                out.extend(std::iter::repeat(String::new()).take(STAT_SUFFIXES.len() - 1));
            }
        }
    }
    out.push(row.high_variance.to_string());
    out
}

/// Write summary rows to any writer
pub fn write_summary<W: Write>(writer: W, rows: &[SummaryRow]) -> Result<()> {
    let keys: Vec<GroupKey> = match rows.first() {
        Some(first) => first.group.iter().map(|(k, _)| *k).collect(),
        None => vec![GroupKey::Model, GroupKey::Mode, GroupKey::Prompt],
    };

    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(summary_header(&keys))?;
    for row in rows {
        wtr.write_record(summary_row(row))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write the summary table to `path`
pub fn write_summary_csv(path: &Path, rows: &[SummaryRow]) -> Result<()> {
    write_summary(File::create(path)?, rows)
}
