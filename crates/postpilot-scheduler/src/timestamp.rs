//! The single boundary between stored timestamp text and `DateTime<Utc>`.
//!
//! Everything written to SQLite goes through [`to_db`] and everything read
//! back goes through [`from_db`]; no other module compares stored strings.

use chrono::{DateTime, Duration, DurationRound, NaiveDateTime, SecondsFormat, Utc};

use crate::error::{Result, SchedulerError};

/// Serialise as fixed-width ISO-8601 UTC with millisecond precision,
/// e.g. `2025-01-01T10:00:00.000Z`.
pub fn to_db(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp into an instant.
///
/// Accepts RFC 3339 with any offset. Offset-less values written by older
/// tooling are interpreted as UTC.
pub fn from_db(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| SchedulerError::InvalidTimestamp(format!("{s}: {e}")))
}

pub fn from_db_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(from_db).transpose()
}

/// Round up to the next whole hour; an instant already on the hour is kept.
pub fn ceil_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    match t.duration_trunc(Duration::hours(1)) {
        Ok(floor) if floor == t => t,
        Ok(floor) => floor + Duration::hours(1),
        Err(_) => t,
    }
}
