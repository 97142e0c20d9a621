//! Utility functions for Fleece CLI

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::time::Duration;

/// Create a progress bar with standard styling
pub fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(concat!(
                "{spinner:.green} [{elapsed_precise}] ",
                "[{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}"
            ))
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

/// Format an optional measurement with fixed precision
pub fn format_optional(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "-".to_string(),
    }
}

/// Format a rate in tokens per second
pub fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:.2} tok/s", r),
        None => "n/a".to_string(),
    }
}

/// Format seconds in human-readable format
pub fn format_seconds(seconds: f64) -> String {
    let duration = Duration::from_secs_f64(seconds.max(0.0));
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else if secs > 0 {
        format!("{}.{:03}s", secs, duration.subsec_millis())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Print a value as pretty JSON on stdout
pub fn print_json(data: &Value) -> Result<()> {
    println!("{}", render_json(data)?);
    Ok(())
}

fn render_json(data: &Value) -> Result<String> {
    Ok(serde_json::to_string_pretty(data)?)
}

/// Print warning with styling
pub fn print_warning(message: &str) {
    eprintln!("{} {}", style("Warning:").yellow().bold(), message);
}

/// Print success message with styling
pub fn print_success(message: &str) {
    println!("{} {}", style("Success:").green().bold(), message);
}
