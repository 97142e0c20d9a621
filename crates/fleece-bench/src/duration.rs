//! Parsing of human-readable duration strings
//!
//! Engine transcripts report durations in Go's `time.Duration` notation
//! (`3m20.5s`, `850.123ms`, `1.5s`). Everything is normalised to seconds as
//! an `f64`. Unrecognised input yields `None`, never an error.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref COMPOSITE: Regex =
        Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(\d+(?:\.\d+)?)s$").unwrap();
    static ref MILLIS: Regex = Regex::new(r"^(\d+(?:\.\d+)?)ms$").unwrap();
    static ref SECONDS: Regex = Regex::new(r"^(\d+(?:\.\d+)?)s$").unwrap();
}

/// Parse a duration string into seconds.
///
/// Grammars are tried in order: `[<int>h][<int>m]<float>s`, `<float>ms`,
/// `<float>s`. Returns `None` for anything else, including negative values.
pub fn parse_duration(text: &str) -> Option<f64> {
    let text = text.trim();

    if let Some(caps) = COMPOSITE.captures(text) {
        let hours = match caps.get(1) {
            Some(m) => m.as_str().parse::<f64>().ok()?,
            None => 0.0,
        };
        let minutes = match caps.get(2) {
            Some(m) => m.as_str().parse::<f64>().ok()?,
            None => 0.0,
        };
        let seconds = caps.get(3)?.as_str().parse::<f64>().ok()?;
        return finite(hours * 3600.0 + minutes * 60.0 + seconds);
    }

    if let Some(caps) = MILLIS.captures(text) {
        let millis = caps.get(1)?.as_str().parse::<f64>().ok()?;
        return finite(millis / 1000.0);
    }

    if let Some(caps) = SECONDS.captures(text) {
        return finite(caps.get(1)?.as_str().parse::<f64>().ok()?);
    }

    None
}

/// Format seconds in the canonical `<float>s` form accepted by [`parse_duration`].
pub fn format_duration(seconds: f64) -> String {
    format!("{}s", seconds)
}

fn finite(value: f64) -> Option<f64> {
    (value.is_finite() && value >= 0.0).then_some(value)
}
