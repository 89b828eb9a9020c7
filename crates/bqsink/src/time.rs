//! Time formatting and parsing helpers
//!
//! Event times arrive from the host as UTC instants. They are rendered into
//! records with [`TimeFormatter`] and into destination ids with
//! [`expand_template`]. Row timestamps written by upstream producers are
//! read back with [`parse_row_time`], which keeps the offset found in the
//! value so that calendar dates are the producer's dates.

use crate::error::{Result, SinkError};
use chrono::format::{Item, StrftimeItems};
use chrono::{
    DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc,
};
use serde_json::Value;

/// Reject strftime patterns that chrono cannot render
pub fn validate_strftime(pattern: &str) -> Result<()> {
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(SinkError::config(format!(
            "invalid strftime pattern: '{}'",
            pattern
        )));
    }
    Ok(())
}

/// Renders event times for injection into records
#[derive(Debug, Clone, Default)]
pub struct TimeFormatter {
    format: Option<String>,
    localtime: bool,
}

impl TimeFormatter {
    /// `format == None` renders RFC 3339 with second precision.
    pub fn new(format: Option<String>, localtime: bool) -> Result<Self> {
        if let Some(ref pattern) = format {
            validate_strftime(pattern)?;
        }
        Ok(Self { format, localtime })
    }

    pub fn format(&self, time: DateTime<Utc>) -> String {
        match (&self.format, self.localtime) {
            (Some(pattern), false) => time.format(pattern).to_string(),
            (Some(pattern), true) => time.with_timezone(&Local).format(pattern).to_string(),
            (None, false) => time.to_rfc3339_opts(SecondsFormat::Secs, true),
            (None, true) => time
                .with_timezone(&Local)
                .to_rfc3339_opts(SecondsFormat::Secs, false),
        }
    }
}

/// Expand a destination template such as `access_%Y%m%d`.
///
/// The template must have passed [`validate_strftime`].
pub fn expand_template(template: &str, time: DateTime<Utc>, localtime: bool) -> String {
    if localtime {
        time.with_timezone(&Local).format(template).to_string()
    } else {
        time.format(template).to_string()
    }
}

/// Interpret a row value as a point in time.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.frac] [+zzzz]`, a bare date, or
/// epoch seconds (number or numeric string). Values without an offset are
/// taken as UTC.
pub fn parse_row_time(value: &Value) -> Option<DateTime<FixedOffset>> {
    match value {
        Value::String(s) => parse_time_str(s.trim()),
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn parse_time_str(s: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t);
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(t) = DateTime::parse_from_str(s, pattern) {
            return Some(t);
        }
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, pattern) {
            return Some(Utc.from_utc_datetime(&t).fixed_offset());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?).fixed_offset());
    }
    s.parse::<f64>().ok().and_then(from_epoch)
}

fn from_epoch(secs: f64) -> Option<DateTime<FixedOffset>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos).map(|t| t.fixed_offset())
}
