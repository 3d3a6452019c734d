//! Timestamp parsing and second-granularity comparison helpers.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::error::{SelectorError, SelectorResult};

/// Parse a timestamp literal used in a date condition.
///
/// Accepts RFC-3339 (`2024-01-01T12:00:00Z`, with offset), a bare date
/// (`2024-01-01`, midnight UTC) and a naive date-time with optional
/// fractional seconds (`2024-01-01T12:00:00.123456789`, read as UTC).
pub fn parse_timestamp(value: &str) -> SelectorResult<DateTime<Utc>> {
    let trimmed = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(SelectorError::InvalidDate {
        value: value.to_string(),
    })
}

/// Drop sub-second precision.
pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}
