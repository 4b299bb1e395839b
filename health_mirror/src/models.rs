//! Diesel row types for the mirror tables.
//!
//! These mirror the raw tables the ingestion pipeline writes:
//! - [`crate::schema::health_metrics`] — continuous samples (heart rate, steps, …)
//! - [`crate::schema::health_events`] — discrete occurrences (workout segments,
//!   generic events, and engine-derived flags)
//!
//! Notes
//! - Timestamps are RFC-3339 UTC strings with millisecond precision (see
//!   [`crate::tz::to_rfc3339_millis`]); `deleted_at` doubles as the tombstone
//!   marker.
//! - Each table gets an owned Queryable struct for reads and a borrowed
//!   Insertable struct for the upsert path.

use diesel::prelude::*;

/// A mirrored continuous sample in [`crate::schema::health_metrics`].
#[derive(Debug, Queryable, Identifiable, Selectable)]
#[diesel(table_name = crate::schema::health_metrics)]
pub struct MetricRow {
    /// Surrogate row id.
    pub id: i32,
    /// Owner the row is mirrored for.
    pub user_id: String,
    /// Sample instant (RFC-3339 UTC).
    pub timestamp: String,
    /// Optional end of the sampled interval (RFC-3339 UTC).
    pub end_ts: Option<String>,
    /// Category string, e.g. "heart_rate" or "steps".
    pub metric_type: String,
    /// Observed value.
    pub metric_value: f64,
    /// Unit string as reported by the source.
    pub unit: Option<String>,
    /// First-mirrored instant (RFC-3339 UTC).
    pub created_at: String,
    /// Device-assigned external identity; upsert conflict key.
    pub hk_uuid: String,
    /// Tombstone marker; non-null rows are soft-deleted.
    pub deleted_at: Option<String>,
    /// Source application bundle id.
    pub source_bundle_id: Option<String>,
    /// Source application name.
    pub source_name: Option<String>,
    /// Source application version.
    pub source_version: Option<String>,
    /// Whether the source flagged the sample as manually entered.
    pub was_user_entered: Option<bool>,
    /// Context metadata JSON (timezone, UTC offset, place).
    pub meta: Option<String>,
}

/// Insertable form of [`MetricRow`] for the upsert path.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::health_metrics)]
pub struct NewMetricRow<'a> {
    /// Owner the row is mirrored for.
    pub user_id: &'a str,
    /// Sample instant (RFC-3339 UTC).
    pub timestamp: &'a str,
    /// Optional end of the sampled interval.
    pub end_ts: Option<&'a str>,
    /// Category string.
    pub metric_type: &'a str,
    /// Observed value.
    pub metric_value: f64,
    /// Unit string.
    pub unit: Option<&'a str>,
    /// First-mirrored instant.
    pub created_at: &'a str,
    /// External identity; upsert conflict key.
    pub hk_uuid: &'a str,
    /// Always `None` on insert — an upsert resurrects tombstoned rows.
    pub deleted_at: Option<&'a str>,
    /// Source application bundle id.
    pub source_bundle_id: Option<&'a str>,
    /// Source application name.
    pub source_name: Option<&'a str>,
    /// Source application version.
    pub source_version: Option<&'a str>,
    /// Manual-entry flag from the source.
    pub was_user_entered: Option<bool>,
    /// Context metadata JSON.
    pub meta: Option<&'a str>,
}

/// A mirrored discrete occurrence in [`crate::schema::health_events`].
#[derive(Debug, Queryable, Identifiable, Selectable)]
#[diesel(table_name = crate::schema::health_events)]
pub struct EventRow {
    /// Surrogate row id.
    pub id: i32,
    /// Owner the row is mirrored for.
    pub user_id: String,
    /// Event instant (RFC-3339 UTC).
    pub timestamp: String,
    /// Optional end of the event interval.
    pub end_ts: Option<String>,
    /// Category string, e.g. "workout_distance_km" or "derived_long_run".
    pub event_type: String,
    /// Observed value.
    pub value: f64,
    /// Unit string.
    pub unit: Option<String>,
    /// First-mirrored instant.
    pub created_at: String,
    /// External identity; with `event_type`, the upsert conflict key.
    pub hk_uuid: String,
    /// Tombstone marker.
    pub deleted_at: Option<String>,
    /// Source application bundle id.
    pub source_bundle_id: Option<String>,
    /// Source application name.
    pub source_name: Option<String>,
    /// Source application version.
    pub source_version: Option<String>,
    /// Manual-entry flag from the source.
    pub was_user_entered: Option<bool>,
    /// Context metadata JSON.
    pub meta: Option<String>,
}

/// Insertable form of [`EventRow`] for the upsert path.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::health_events)]
pub struct NewEventRow<'a> {
    /// Owner the row is mirrored for.
    pub user_id: &'a str,
    /// Event instant (RFC-3339 UTC).
    pub timestamp: &'a str,
    /// Optional end of the event interval.
    pub end_ts: Option<&'a str>,
    /// Category string.
    pub event_type: &'a str,
    /// Observed value.
    pub value: f64,
    /// Unit string.
    pub unit: Option<&'a str>,
    /// First-mirrored instant.
    pub created_at: &'a str,
    /// External identity.
    pub hk_uuid: &'a str,
    /// Always `None` on insert.
    pub deleted_at: Option<&'a str>,
    /// Source application bundle id.
    pub source_bundle_id: Option<&'a str>,
    /// Source application name.
    pub source_name: Option<&'a str>,
    /// Source application version.
    pub source_version: Option<&'a str>,
    /// Manual-entry flag from the source.
    pub was_user_entered: Option<bool>,
    /// Context metadata JSON.
    pub meta: Option<&'a str>,
}
