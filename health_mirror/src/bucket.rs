//! bucket.rs — UTC bucket mapping for rollup granularities
//!
//! - One stable epoch: Unix (1970-01-01T00:00:00Z).
//! - Fixed-size frames only (hour/day): second-based math.
//!
//! All functions assume the input timestamp is UTC.

use chrono::{DateTime, Duration, Utc};

/// Unix epoch start (1970-01-01T00:00:00Z).
pub const EPOCH_UNIX: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Number of seconds in an hour.
pub const SECS_PER_HOUR: i64 = 60 * 60;
/// Number of seconds in a day.
pub const SECS_PER_DAY: i64 = 24 * SECS_PER_HOUR;

/// Rollup bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// UTC hour
    Hour,
    /// UTC day
    Day,
}

impl Granularity {
    fn width_secs(self) -> i64 {
        match self {
            Granularity::Hour => SECS_PER_HOUR,
            Granularity::Day => SECS_PER_DAY,
        }
    }
}

/// Compute the bucket id for a UTC timestamp.
pub fn bucket_id(ts_utc: DateTime<Utc>, g: Granularity) -> i64 {
    let secs = ts_utc.signed_duration_since(EPOCH_UNIX).num_seconds();
    secs.div_euclid(g.width_secs())
}

/// Get the UTC start instant for a bucket id.
pub fn bucket_start_utc(id: i64, g: Granularity) -> DateTime<Utc> {
    EPOCH_UNIX + Duration::seconds(id * g.width_secs())
}

/// Exclusive end instant for the bucket (start + width).
pub fn bucket_end_exclusive_utc(id: i64, g: Granularity) -> DateTime<Utc> {
    bucket_start_utc(id + 1, g)
}

/// Floor a timestamp to the start of its bucket.
pub fn truncate(ts_utc: DateTime<Utc>, g: Granularity) -> DateTime<Utc> {
    bucket_start_utc(bucket_id(ts_utc, g), g)
}
