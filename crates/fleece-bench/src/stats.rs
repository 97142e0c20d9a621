//! Descriptive statistics over run records
//!
//! Records are grouped by an ordered tuple of [`GroupKey`]s and each
//! [`StatField`] is reduced to count, mean, sample standard deviation, min,
//! max, median and coefficient of variation. Nulls are excluded, never
//! treated as zero.

use crate::record::RunRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coefficient of variation (percent) above which a group is flagged
pub const HIGH_VARIANCE_CV_PCT: f64 = 10.0;

/// Field whose CV decides `high_variance`
pub const PRIMARY_RATE: StatField = StatField::EvalRate;

/// Group value used for rollup rows
pub const ALL_GROUP: &str = "ALL";

/// Record attribute used for grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    Model,
    Mode,
    Prompt,
}

impl GroupKey {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Mode => "mode",
            Self::Prompt => "prompt_id",
        }
    }

    pub fn value(&self, record: &RunRecord) -> String {
        match self {
            Self::Model => record.model.clone(),
            Self::Mode => record.mode.to_string(),
            Self::Prompt => record.prompt_id.clone(),
        }
    }
}

/// Numeric record attribute that can be summarised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatField {
    EvalRate,
    PromptEvalRate,
    TotalDuration,
    LoadDuration,
    EvalCount,
    GpuUtilMean,
    GpuPowerMean,
    GpuMemMax,
}

impl StatField {
    /// Fields summarised by [`summarize`]
    pub const ALL: &'static [StatField] = &[
        StatField::EvalRate,
        StatField::PromptEvalRate,
        StatField::TotalDuration,
        StatField::LoadDuration,
        StatField::EvalCount,
        StatField::GpuUtilMean,
        StatField::GpuPowerMean,
        StatField::GpuMemMax,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::EvalRate => "eval_rate",
            Self::PromptEvalRate => "prompt_eval_rate",
            Self::TotalDuration => "total_duration",
            Self::LoadDuration => "load_duration",
            Self::EvalCount => "eval_count",
            Self::GpuUtilMean => "gpu_util_mean",
            Self::GpuPowerMean => "gpu_power_mean",
            Self::GpuMemMax => "gpu_mem_max",
        }
    }

    pub fn value(&self, record: &RunRecord) -> Option<f64> {
        match self {
            Self::EvalRate => record.metrics.eval_rate,
            Self::PromptEvalRate => record.metrics.prompt_eval_rate,
            Self::TotalDuration => record.metrics.total_duration,
            Self::LoadDuration => record.metrics.load_duration,
            Self::EvalCount => record.metrics.eval_count.map(|c| c as f64),
            Self::GpuUtilMean => record.gpu.util_mean,
            Self::GpuPowerMean => record.gpu.power_mean,
            Self::GpuMemMax => record.gpu.mem_max,
        }
    }
}

/// Descriptive statistics for one field within one group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub count: usize,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    /// `None` when the mean is zero
    pub cv_pct: Option<f64>,
}

/// Summarise a set of values. Returns `None` for an empty set.
pub fn describe(values: &[f64]) -> Option<FieldStats> {
    if values.is_empty() {
        return None;
    }

    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;

    let stddev = if n > 1 {
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        variance.sqrt()
    } else {
        0.0
    };

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };

    let cv_pct = (mean != 0.0).then(|| stddev / mean * 100.0);

    Some(FieldStats {
        count: n,
        mean,
        stddev,
        min: sorted[0],
        max: sorted[n - 1],
        median,
        cv_pct,
    })
}

/// Statistics for one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    /// Group values in key order
    pub group: Vec<(GroupKey, String)>,
    /// Number of records in the group, including those with null fields
    pub runs: usize,
    /// Per-field statistics; `None` when every value was null
    pub stats: Vec<(StatField, Option<FieldStats>)>,
    pub high_variance: bool,
}

impl SummaryRow {
    pub fn group_value(&self, key: GroupKey) -> Option<&str> {
        self.group
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn stat(&self, field: StatField) -> Option<&FieldStats> {
        self.stats
            .iter()
            .find(|(f, _)| *f == field)
            .and_then(|(_, s)| s.as_ref())
    }
}

/// Group `records` by `keys` and summarise `fields`.
///
/// Groups appear in order of first occurrence. The input is not modified.
pub fn aggregate(
    records: &[RunRecord],
    keys: &[GroupKey],
    fields: &[StatField],
) -> Vec<SummaryRow> {
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<String>, Vec<&RunRecord>)> = Vec::new();

    for record in records {
        let values: Vec<String> = keys.iter().map(|k| k.value(record)).collect();
        match index.get(&values) {
            Some(&i) => groups[i].1.push(record),
            None => {
                index.insert(values.clone(), groups.len());
                groups.push((values, vec![record]));
            }
        }
    }

    groups
        .into_iter()
        .map(|(values, members)| {
            let column = |field: StatField| -> Vec<f64> {
                members.iter().filter_map(|r| field.value(r)).collect()
            };

            let stats = fields
                .iter()
                .map(|&field| (field, describe(&column(field))))
                .collect();

            let high_variance = describe(&column(PRIMARY_RATE))
                .and_then(|s| s.cv_pct)
                .map_or(false, |cv| cv > HIGH_VARIANCE_CV_PCT);

            SummaryRow {
                group: keys.iter().copied().zip(values).collect(),
                runs: members.len(),
                stats,
                high_variance,
            }
        })
        .collect()
}

/// Aggregate with `collapsed` removed from the grouping, reporting it as [`ALL_GROUP`].
///
/// The resulting rows carry the same key layout as `aggregate(records, keys, ..)`.
pub fn rollup(
    records: &[RunRecord],
    keys: &[GroupKey],
    collapsed: GroupKey,
    fields: &[StatField],
) -> Vec<SummaryRow> {
    let kept: Vec<GroupKey> = keys.iter().copied().filter(|k| *k != collapsed).collect();

    aggregate(records, &kept, fields)
        .into_iter()
        .map(|mut row| {
            row.group = keys
                .iter()
                .map(|&k| {
                    let value = if k == collapsed {
                        ALL_GROUP.to_string()
                    } else {
                        row.group_value(k).map(str::to_string).unwrap_or_default()
                    };
                    (k, value)
                })
                .collect();
            row
        })
        .collect()
}

/// Per (model, mode, prompt) rows followed by per (model, mode) rollups
pub fn summarize(records: &[RunRecord]) -> Vec<SummaryRow> {
    let keys = [GroupKey::Model, GroupKey::Mode, GroupKey::Prompt];
    let mut rows = aggregate(records, &keys, StatField::ALL);
    rows.extend(rollup(records, &keys, GroupKey::Prompt, StatField::ALL));
    rows
}
