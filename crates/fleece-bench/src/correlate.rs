//! Correlation of telemetry samples with run windows

use crate::telemetry::TelemetrySample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// GPU statistics over the samples inside one run window.
///
/// All statistics are `None` when no sample fell inside the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub mem_max: Option<f64>,
    pub mem_min: Option<f64>,
    pub util_max: Option<f64>,
    pub util_mean: Option<f64>,
    pub power_max: Option<f64>,
    pub power_mean: Option<f64>,
    pub temp_max: Option<f64>,
    pub sample_count: usize,
}

impl WindowStats {
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

/// Round to one decimal place
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

type Field = fn(&TelemetrySample) -> f64;

/// Reduce the samples with `start <= timestamp <= end`.
///
/// Samples need not be sorted; clock skew between writer and reader only
/// shrinks the match set.
pub fn correlate(
    samples: &[TelemetrySample],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> WindowStats {
    let window: Vec<&TelemetrySample> = samples
        .iter()
        .filter(|s| start <= s.timestamp && s.timestamp <= end)
        .collect();

    if window.is_empty() {
        return WindowStats::default();
    }

    let n = window.len() as f64;
    let values = |f: Field| window.iter().map(move |s| f(s));
    let max = |f: Field| values(f).fold(f64::NEG_INFINITY, f64::max);
    let min = |f: Field| values(f).fold(f64::INFINITY, f64::min);
    let mean = |f: Field| round1(values(f).sum::<f64>() / n);

    WindowStats {
        mem_max: Some(max(|s| s.memory_used)),
        mem_min: Some(min(|s| s.memory_used)),
        util_max: Some(max(|s| s.utilization_pct)),
        util_mean: Some(mean(|s| s.utilization_pct)),
        power_max: Some(max(|s| s.power_draw)),
        power_mean: Some(mean(|s| s.power_draw)),
        temp_max: Some(max(|s| s.temperature)),
        sample_count: window.len(),
    }
}
