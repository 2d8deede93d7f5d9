//! # Duration Parsing
//!
//! Handles parsing of Kubernetes-style duration strings used for timeouts.

use crate::constants::MAX_DURATION_SECS;
use crate::error::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;

static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d+)(?P<unit>ms|[smhd])$").expect("duration regex is valid")
});

/// Parse a duration string into `std::time::Duration`
/// Supports formats: "500ms", "30s", "1m", "5m", "1h", "1d"
/// Durations above 30 days are rejected.
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let trimmed = duration_str.trim();

    if trimmed.is_empty() {
        return Err(Error::config("duration string cannot be empty"));
    }

    let lower = trimmed.to_lowercase();
    let captures = DURATION_REGEX.captures(&lower).ok_or_else(|| {
        Error::config(format!(
            "invalid duration format '{trimmed}'. Expected format: <number><unit> (e.g., '30s', '5m', '1h')"
        ))
    })?;

    let number: u64 = captures["number"]
        .parse()
        .map_err(|e| Error::config(format!("invalid duration number in '{trimmed}': {e}")))?;

    if number == 0 {
        return Err(Error::config(format!(
            "duration must be greater than 0, got '{trimmed}'"
        )));
    }

    let seconds = |factor: u64| {
        number
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| Error::config(format!("duration '{trimmed}' is too large")))
    };
    let duration = match &captures["unit"] {
        "ms" => Duration::from_millis(number),
        "s" => Duration::from_secs(number),
        "m" => seconds(60)?,
        "h" => seconds(3600)?,
        "d" => seconds(86400)?,
        unit => {
            return Err(Error::config(format!(
                "invalid unit '{unit}' in duration '{trimmed}'"
            )))
        }
    };

    if duration > Duration::from_secs(MAX_DURATION_SECS) {
        return Err(Error::config(format!(
            "duration '{trimmed}' exceeds the maximum of 30d"
        )));
    }

    Ok(duration)
}

/// Instant `timeout` from now, clamped to 30 days so it never overflows
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    let timeout = timeout.min(Duration::from_secs(MAX_DURATION_SECS));
    now.checked_add(timeout).unwrap_or(now)
}
