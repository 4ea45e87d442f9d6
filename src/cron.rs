//! Cron expression parsing and next-run computation.
//!
//! Pure functions over `(expression, now)` with no I/O, so scheduling
//! stays trivially testable. Supported grammar:
//!
//! - standard 5-field expressions (`minute hour dom month dow`),
//! - 6-field expressions with a leading seconds field,
//! - the descriptors `@yearly` / `@annually` / `@monthly` / `@weekly` /
//!   `@daily` / `@hourly`.
//!
//! An empty expression means "one-shot": [`next_run`] returns `None`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{Error, Result};

/// Compute the next fire time strictly after `now`.
///
/// Returns `Ok(None)` for an empty expression (a one-shot task) and
/// `InvalidArg` for an unparsable one.
pub fn next_run(expr: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if expr.trim().is_empty() {
        return Ok(None);
    }

    let schedule = parse(expr)?;
    Ok(schedule.after(&now).next())
}

/// Validate an expression without computing anything.
pub fn validate(expr: &str) -> Result<()> {
    if expr.trim().is_empty() {
        return Ok(());
    }
    parse(expr).map(|_| ())
}

fn parse(expr: &str) -> Result<Schedule> {
    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized)
        .map_err(|e| Error::invalid_arg(format!("invalid cron expression '{expr}': {e}")))
}

/// Expand descriptors and pad 5-field expressions with a zero seconds
/// field, yielding the 6/7-field form the parser expects.
fn normalize(expr: &str) -> Result<String> {
    let trimmed = expr.trim();

    match trimmed {
        "@yearly" | "@annually" => return Ok("0 0 0 1 1 *".to_string()),
        "@monthly" => return Ok("0 0 0 1 * *".to_string()),
        "@weekly" => return Ok("0 0 0 * * SUN".to_string()),
        "@daily" => return Ok("0 0 0 * * *".to_string()),
        "@hourly" => return Ok("0 0 * * * *".to_string()),
        _ => {}
    }

    if trimmed.starts_with('@') {
        return Err(Error::invalid_arg(format!(
            "unknown cron descriptor '{trimmed}'"
        )));
    }

    let fields = trimmed.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {trimmed}")),
        6 | 7 => Ok(trimmed.to_string()),
        n => Err(Error::invalid_arg(format!(
            "cron expression must have 5-7 fields, got {n}: '{trimmed}'"
        ))),
    }
}
