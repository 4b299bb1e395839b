//! Timestamp parsing and formatting helpers.
//!
//! What this module provides:
//! - [`parse_ts_to_utc`]: Parse RFC-3339 timestamps with an explicit offset and convert to UTC.
//! - [`parse_ts_lenient`]: Best-effort parsing of the timestamp shapes seen in device
//!   exports (RFC-3339, space- or `T`-separated naive datetimes, bare dates). Naive
//!   values are taken as UTC; anything unparseable becomes `None` instead of an error.
//! - [`validate_zone_name`]: Check an IANA zone name ("America/New_York") before it is
//!   persisted in row context metadata.
//! - [`to_rfc3339_millis`]: Canonical storage format.
//!
//! Notes:
//! - All database writes are RFC-3339 UTC strings with millisecond precision. The
//!   format is fixed-width, so lexicographic comparison in SQL matches instant order
//!   and range filters on the `timestamp` columns are correct.
//! - Local times never reach storage; a row's zone name and UTC offset only travel
//!   along as context metadata.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;

/// RFC-3339 with offset -> UTC.
///
/// Example:
/// - "2024-03-10T09:30:00-05:00" -> "2024-03-10T14:30:00Z"
pub fn parse_ts_to_utc(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad rfc3339: {s}"))?;
    Ok(dt.with_timezone(&Utc))
}

/// Best-effort timestamp parse; invalid or empty input coerces to `None`.
///
/// Accepted shapes, tried in order:
/// - RFC-3339 with offset or `Z`
/// - `YYYY-MM-DDTHH:MM:SS[.fff]` and `YYYY-MM-DD HH:MM:SS[.fff]` (assumed UTC)
/// - `YYYY-MM-DD` (midnight UTC)
pub fn parse_ts_lenient(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Validate an IANA zone name, returning the canonical spelling.
pub fn validate_zone_name(name: &str) -> anyhow::Result<String> {
    let tz: Tz = name
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("bad tz: {name}"))?;
    Ok(tz.name().to_string())
}

/// Format a UTC datetime as an RFC-3339 string with millisecond precision.
pub fn to_rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
