//! Timestamp encoding used by the schema.
//!
//! `fire_at` columns hold integer unix seconds; everything else is RFC 3339
//! text, except `paid_through`, which is a plain `YYYY-MM-DD` date.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeDelta, TimeZone, Utc};
use dripcast_core::error::{DripError, Result};

pub fn to_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub fn from_text(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

pub fn to_secs(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub fn from_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

pub fn date_to_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn date_from_text(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Longest drip offset a template may carry: ten years.
pub const MAX_DELAY_HOURS: f64 = 24.0 * 3650.0;

/// Non-negative, finite, and at most [`MAX_DELAY_HOURS`].
pub fn check_delay_hours(delay_hours: f64) -> Result<()> {
    if !delay_hours.is_finite() || delay_hours < 0.0 {
        return Err(DripError::validation(
            "delay_hours",
            format!("must be a non-negative number (got {delay_hours})"),
        ));
    }
    if delay_hours > MAX_DELAY_HOURS {
        return Err(DripError::validation(
            "delay_hours",
            format!("must be at most {MAX_DELAY_HOURS} (got {delay_hours})"),
        ));
    }
    Ok(())
}

/// `anchor + delay_hours`, in whole seconds. Fractional hours round to the
/// nearest second (0.05 h = 180 s).
pub fn offset_by_hours(anchor: DateTime<Utc>, delay_hours: f64) -> Result<DateTime<Utc>> {
    check_delay_hours(delay_hours)?;
    let secs = (delay_hours * 3600.0).round() as i64;
    TimeDelta::try_seconds(secs)
        .and_then(|delta| anchor.checked_add_signed(delta))
        .ok_or_else(|| {
            DripError::validation(
                "delay_hours",
                format!("{delay_hours}h from {anchor} is out of range"),
            )
        })
}

/// Calendar date of `at` in a fixed local offset.
pub fn local_date(at: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDate {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
        .unwrap_or_else(|| Utc.fix());
    at.with_timezone(&offset).date_naive()
}
