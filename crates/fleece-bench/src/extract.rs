//! Metric extraction from engine transcripts
//!
//! The engine prints a block of performance counters after each response:
//!
//! ```text
//! total duration:       1.5s
//! load duration:        12.3ms
//! prompt eval count:    26 token(s)
//! prompt eval duration: 80ms
//! prompt eval rate:     325.00 tokens/s
//! eval count:           100 token(s)
//! eval duration:        1s
//! eval rate:            100.00 tokens/s
//! ```
//!
//! Extraction is driven by [`METRIC_GRAMMAR`]. Each label is anchored at the
//! start of a line so that `eval count` never matches inside
//! `prompt eval count`.

use crate::duration::parse_duration;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Warning attached when prompt and generation counters look like the same line
pub const PARSE_COLLISION_WARNING: &str = "possible_parse_collision";

/// Counters parsed from one transcript. Every field is independently optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub total_duration: Option<f64>,
    pub load_duration: Option<f64>,
    pub prompt_eval_count: Option<u64>,
    pub prompt_eval_duration: Option<f64>,
    pub prompt_eval_rate: Option<f64>,
    pub eval_count: Option<u64>,
    pub eval_duration: Option<f64>,
    pub eval_rate: Option<f64>,
}

impl MetricRecord {
    /// True when no counter was found at all
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Prompt and generation phases report identical nonzero counts and rates.
    ///
    /// This usually means both labels matched the same line. The record is
    /// left untouched; callers attach [`PARSE_COLLISION_WARNING`].
    pub fn possible_parse_collision(&self) -> bool {
        match (
            self.prompt_eval_count,
            self.eval_count,
            self.prompt_eval_rate,
            self.eval_rate,
        ) {
            (Some(pc), Some(ec), Some(pr), Some(er)) => {
                pc == ec && pr == er && pc != 0 && pr != 0.0
            }
            _ => false,
        }
    }
}

/// Which [`MetricRecord`] field a grammar entry fills
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricField {
    TotalDuration,
    LoadDuration,
    PromptEvalCount,
    PromptEvalDuration,
    PromptEvalRate,
    EvalCount,
    EvalDuration,
    EvalRate,
}

/// Shape of the value following a label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueGrammar {
    /// A duration token understood by [`parse_duration`]
    Duration,
    /// A non-negative integer
    Count,
    /// A float followed by `tokens/s`
    Rate,
}

impl ValueGrammar {
    fn pattern(self) -> &'static str {
        match self {
            Self::Duration => r"(\S+)",
            Self::Count => r"(\d+)",
            Self::Rate => r"(\d+(?:\.\d+)?)\s*tokens/s",
        }
    }
}

/// Label table consulted by [`extract_metrics`]
pub const METRIC_GRAMMAR: &[(&str, MetricField, ValueGrammar)] = &[
    ("total duration", MetricField::TotalDuration, ValueGrammar::Duration),
    ("load duration", MetricField::LoadDuration, ValueGrammar::Duration),
    ("prompt eval count", MetricField::PromptEvalCount, ValueGrammar::Count),
    ("prompt eval duration", MetricField::PromptEvalDuration, ValueGrammar::Duration),
    ("prompt eval rate", MetricField::PromptEvalRate, ValueGrammar::Rate),
    ("eval count", MetricField::EvalCount, ValueGrammar::Count),
    ("eval duration", MetricField::EvalDuration, ValueGrammar::Duration),
    ("eval rate", MetricField::EvalRate, ValueGrammar::Rate),
];

struct CompiledRule {
    field: MetricField,
    grammar: ValueGrammar,
    regex: Regex,
}

fn label_regex(label: &str, grammar: ValueGrammar) -> Regex {
    let label = regex::escape(label).replace(' ', r"[ \t]+");
    Regex::new(&format!(r"(?im)^[ \t]*{}:[ \t]*{}", label, grammar.pattern())).unwrap()
}

lazy_static! {
    static ref RULES: Vec<CompiledRule> = METRIC_GRAMMAR
        .iter()
        .map(|&(label, field, grammar)| CompiledRule {
            field,
            grammar,
            regex: label_regex(label, grammar),
        })
        .collect();
    static ref TOTAL_DURATION_MARKER: Regex =
        label_regex("total duration", ValueGrammar::Duration);
    static ref EVAL_RATE_MARKER: Regex = label_regex("eval rate", ValueGrammar::Rate);
}

/// Extract every recognised counter from a transcript. The first match per label wins.
pub fn extract_metrics(text: &str) -> MetricRecord {
    let mut record = MetricRecord::default();

    for rule in RULES.iter() {
        let Some(raw) = rule
            .regex
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
        else {
            continue;
        };

        match rule.grammar {
            ValueGrammar::Duration => {
                let value = parse_duration(raw);
                match rule.field {
                    MetricField::TotalDuration => record.total_duration = value,
                    MetricField::LoadDuration => record.load_duration = value,
                    MetricField::PromptEvalDuration => record.prompt_eval_duration = value,
                    MetricField::EvalDuration => record.eval_duration = value,
                    _ => {}
                }
            }
            ValueGrammar::Count => {
                let value = raw.parse::<u64>().ok();
                match rule.field {
                    MetricField::PromptEvalCount => record.prompt_eval_count = value,
                    MetricField::EvalCount => record.eval_count = value,
                    _ => {}
                }
            }
            ValueGrammar::Rate => {
                let value = raw.parse::<f64>().ok().filter(|v| v.is_finite());
                match rule.field {
                    MetricField::PromptEvalRate => record.prompt_eval_rate = value,
                    MetricField::EvalRate => record.eval_rate = value,
                    _ => {}
                }
            }
        }
    }

    record
}

/// Read and extract a transcript file. A missing or unreadable file yields an empty record.
pub fn extract_metrics_from_file(path: &Path) -> MetricRecord {
    match std::fs::read_to_string(path) {
        Ok(text) => extract_metrics(&text),
        Err(e) => {
            tracing::debug!("No transcript at {}: {}", path.display(), e);
            MetricRecord::default()
        }
    }
}

/// Cheap check that a transcript finished: both the total duration and eval
/// rate markers are present.
pub fn has_completion_markers(text: &str) -> bool {
    TOTAL_DURATION_MARKER.is_match(text) && EVAL_RATE_MARKER.is_match(text)
}
