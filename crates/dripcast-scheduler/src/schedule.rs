//! Daily schedule expressions.
//! Format: "MIN HOUR * * *" (5-field, no seconds), evaluated in a fixed UTC offset.
//! Fields: *, */N, N, N-M, N-M/S, and comma lists such as "0,30".
//! Example: "5 0 * * *" = every day at 00:05 local time.

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use dripcast_core::error::{DripError, Result};

/// A parsed daily schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySchedule {
    expression: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
}

impl DailySchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(DripError::Config(format!(
                "invalid schedule '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }
        if parts[2..].iter().any(|p| *p != "*") {
            return Err(DripError::Config(format!(
                "invalid schedule '{expression}': day, month and weekday must be '*'"
            )));
        }
        let minutes = parse_field(parts[0], 0, 59).ok_or_else(|| bad_field(expression, "minute"))?;
        let hours = parse_field(parts[1], 0, 23).ok_or_else(|| bad_field(expression, "hour"))?;
        Ok(Self {
            expression: expression.to_string(),
            minutes,
            hours,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First matching minute strictly after `after`, with the schedule read
    /// in local time `UTC + utc_offset_minutes`.
    pub fn next_after(&self, after: DateTime<Utc>, utc_offset_minutes: i32) -> Option<DateTime<Utc>> {
        let offset = Duration::minutes(utc_offset_minutes as i64);
        let local: NaiveDateTime = (after + offset).naive_utc();
        let mut candidate = (local + Duration::minutes(1)).with_second(0)?.with_nanosecond(0)?;

        // Every valid expression matches at least once a day.
        for _ in 0..(48 * 60) {
            if self.minutes.contains(&candidate.minute()) && self.hours.contains(&candidate.hour()) {
                return Some(candidate.and_utc() - offset);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn bad_field(expression: &str, field: &str) -> DripError {
    DripError::Config(format!("invalid {field} field in schedule '{expression}'"))
}

/// Parse one field into its matching values. A field is a comma list of
/// `*`, `*/N`, `N`, `N-M` or `N-M/S` items.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut vals = Vec::new();
    for item in field.split(',') {
        vals.extend(parse_item(item.trim(), min, max)?);
    }
    vals.sort_unstable();
    vals.dedup();
    Some(vals)
}

fn parse_item(item: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, step.parse::<u32>().ok().filter(|n| *n > 0)?),
        None => (item, 1),
    };
    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((lo, hi)) = range.split_once('-') {
        (lo.parse().ok()?, hi.parse().ok()?)
    } else {
        let n: u32 = range.parse().ok()?;
        // "N/S" is not meaningful for a single value.
        if step != 1 {
            return None;
        }
        (n, n)
    };
    if lo < min || hi > max || lo > hi {
        return None;
    }
    Some((lo..=hi).step_by(step as usize).collect())
}
