//! Batch decoding and normalization.
//!
//! ## What this does
//! - Decodes a queue payload (base64 over CSV bytes) into typed [`RawRecord`]s.
//! - Normalizes records into validated [`SampleRow`]s: timestamps parsed to UTC
//!   (invalid ones coerce to missing instead of erroring), ops tagged, and every
//!   row stamped with the caller-authenticated owner id. An owner id embedded in
//!   the payload is a malformed-client signal and is never trusted.
//! - Routes rows to the *events* class (`event_`/`workout_` type prefix) or the
//!   *metrics* class (everything else).
//! - Applies the rolling retention window relative to the batch's newest
//!   timestamp. Delete rows are exempt: a tombstone must never be dropped by
//!   timestamp filtering.
//! - Fails fast when upsert rows lack an external identity — identity-less
//!   writes would corrupt dedup, so the whole batch is rejected before any
//!   storage is touched.
//!
//! A batch with no resolvable timestamps and no delete rows normalizes to an
//! empty [`NormalizedBatch`]; the pipeline short-circuits on it without opening
//! a transaction.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::tz;

/// Type prefix reserved for rows the engine computes itself.
pub const DERIVED_PREFIX: &str = "derived_";

const EVENT_PREFIXES: [&str; 2] = ["event_", "workout_"];

/// Errors that reject a batch before any storage mutation.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The payload was not valid base64.
    #[error("failed to decode batch payload: {0}")]
    Decode(String),
    /// The decoded bytes were not parseable CSV.
    #[error("failed to parse batch csv: {0}")]
    Csv(String),
    /// One or more upsert rows carried no external identity.
    #[error("upsert rows missing external identity: {count} rows")]
    MissingIdentity {
        /// Number of offending rows.
        count: usize,
    },
}

/// How a row asks to be applied to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    /// Insert-or-merge by external identity (the default).
    Upsert,
    /// Tombstone the matching identity.
    Delete,
}

/// One CSV row as shipped by the client, prior to validation.
///
/// All fields are optional at this stage; normalization decides what is usable.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    /// Sample instant, any of the accepted timestamp shapes.
    pub timestamp: Option<String>,
    /// Interval end, if the sample spans one.
    pub end_ts: Option<String>,
    /// Metric category (continuous samples).
    pub metric_type: Option<String>,
    /// Event category (discrete occurrences). Takes precedence over `metric_type`.
    pub event_type: Option<String>,
    /// Observed value.
    pub metric_value: Option<f64>,
    /// `upsert` (default) or `delete`.
    pub op: Option<String>,
    /// Device-assigned external identity.
    pub hk_uuid: Option<String>,
    /// Unit string.
    pub unit: Option<String>,
    /// Owner id the client claims; ignored in favor of the authenticated owner.
    pub user_id: Option<String>,
    /// Client-side creation instant.
    pub created_at: Option<String>,
    /// Source application bundle id.
    pub source_bundle_id: Option<String>,
    /// Source application name.
    pub source_name: Option<String>,
    /// Source application version.
    pub source_version: Option<String>,
    /// Manual-entry flag ("true"/"false"/"1"/"0").
    pub was_user_entered: Option<String>,
    /// IANA timezone name the sample was recorded in.
    pub timezone: Option<String>,
    /// UTC offset at recording time, minutes.
    pub utc_offset_min: Option<String>,
    /// Recording place, country.
    pub place_country: Option<String>,
    /// Recording place, region.
    pub place_region: Option<String>,
    /// Recording place, city.
    pub place_city: Option<String>,
}

/// Context metadata carried along with a row, persisted as one JSON column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowContext {
    /// IANA timezone name as reported by the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// UTC offset at recording time, minutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utc_offset_min: Option<i32>,
    /// Recording place, country.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place_country: Option<String>,
    /// Recording place, region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place_region: Option<String>,
    /// Recording place, city.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place_city: Option<String>,
}

impl RowContext {
    fn is_empty(&self) -> bool {
        self.timezone.is_none()
            && self.utc_offset_min.is_none()
            && self.place_country.is_none()
            && self.place_region.is_none()
            && self.place_city.is_none()
    }

    /// Serialize to the JSON shape stored in the `meta` column, `None` when empty.
    pub fn to_json(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        serde_json::to_string(self).ok()
    }
}

/// A validated row, stamped with the authenticated owner and ready for the
/// mirror writer.
#[derive(Debug, Clone)]
pub struct SampleRow {
    /// Authenticated owner id (never the payload's claim).
    pub user_id: String,
    /// External identity; required for upserts, optional for deletes.
    pub hk_uuid: Option<String>,
    /// Sample instant in UTC. `None` only on delete rows.
    pub timestamp: Option<DateTime<Utc>>,
    /// Interval end in UTC.
    pub end_ts: Option<DateTime<Utc>>,
    /// Metric or event category.
    pub kind: String,
    /// Observed value (0.0 on delete rows, where it is unused).
    pub value: f64,
    /// Unit string.
    pub unit: Option<String>,
    /// First-seen instant; client-supplied when parseable, else batch receipt time.
    pub created_at: DateTime<Utc>,
    /// Requested operation.
    pub op: RowOp,
    /// Source application bundle id.
    pub source_bundle_id: Option<String>,
    /// Source application name.
    pub source_name: Option<String>,
    /// Source application version.
    pub source_version: Option<String>,
    /// Manual-entry flag.
    pub was_user_entered: Option<bool>,
    /// Context metadata JSON for the `meta` column.
    pub meta: Option<String>,
}

impl SampleRow {
    /// True when this row routes to the events table.
    pub fn is_event(&self) -> bool {
        is_event_kind(&self.kind)
    }
}

/// The outcome of decoding + normalizing one batch.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    /// Rows routed to the events table, in payload order.
    pub events: Vec<SampleRow>,
    /// Rows routed to the metrics table, in payload order.
    pub metrics: Vec<SampleRow>,
    /// Most frequent valid IANA zone name seen in the batch.
    pub dominant_timezone: Option<String>,
    /// Upsert rows dropped by the retention window.
    pub dropped_by_retention: usize,
    /// Rows dropped as unusable (no type, no value, unresolvable timestamp,
    /// or a forged `derived_` type).
    pub dropped_invalid: usize,
}

impl NormalizedBatch {
    /// True when nothing survived normalization; the pipeline skips storage.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.metrics.is_empty()
    }
}

fn is_event_kind(kind: &str) -> bool {
    EVENT_PREFIXES.iter().any(|p| kind.starts_with(p))
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_bool_lenient(s: Option<&str>) -> Option<bool> {
    match s?.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_i32_lenient(s: Option<&str>) -> Option<i32> {
    s?.trim().parse().ok()
}

fn decode_payload(payload_b64: &str) -> Result<Vec<u8>, BatchError> {
    BASE64
        .decode(payload_b64.trim())
        .map_err(|e| BatchError::Decode(e.to_string()))
}

fn parse_csv(bytes: &[u8]) -> Result<Vec<RawRecord>, BatchError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let mut records = Vec::new();
    for row in reader.deserialize::<RawRecord>() {
        records.push(row.map_err(|e| BatchError::Csv(e.to_string()))?);
    }
    Ok(records)
}

/// Decode a queue payload and normalize it for the mirror writer.
///
/// `owner_id` is the caller-authenticated identity; every surviving row is
/// stamped with it. `now` anchors `created_at` fallbacks so ingestion stays
/// deterministic under test.
///
/// Errors:
/// - Undecodable payloads ([`BatchError::Decode`], [`BatchError::Csv`])
/// - Upsert rows without an external identity ([`BatchError::MissingIdentity`])
pub fn decode_and_normalize(
    payload_b64: &str,
    owner_id: &str,
    retention_days: i64,
    now: DateTime<Utc>,
) -> Result<NormalizedBatch, BatchError> {
    let bytes = decode_payload(payload_b64)?;
    let records = parse_csv(&bytes)?;
    normalize_records(records, owner_id, retention_days, now)
}

fn normalize_records(
    records: Vec<RawRecord>,
    owner_id: &str,
    retention_days: i64,
    now: DateTime<Utc>,
) -> Result<NormalizedBatch, BatchError> {
    let mut out = NormalizedBatch::default();
    let mut rows = Vec::with_capacity(records.len());
    let mut tz_votes: HashMap<String, usize> = HashMap::new();
    let mut foreign_owner_rows = 0usize;

    for rec in records {
        let op = match rec.op.as_deref().map(|s| s.trim().to_lowercase()) {
            Some(ref s) if s == "delete" => RowOp::Delete,
            _ => RowOp::Upsert,
        };

        let Some(kind) = non_empty(rec.event_type).or_else(|| non_empty(rec.metric_type)) else {
            out.dropped_invalid += 1;
            continue;
        };
        if kind.starts_with(DERIVED_PREFIX) {
            // The derived namespace is engine-owned; a client cannot assert it.
            warn!(kind = %kind, "skipping payload row claiming a derived event type");
            out.dropped_invalid += 1;
            continue;
        }

        if let Some(claimed) = rec.user_id.as_deref()
            && !claimed.is_empty()
            && claimed != owner_id
        {
            foreign_owner_rows += 1;
        }

        let timestamp = rec.timestamp.as_deref().and_then(tz::parse_ts_lenient);
        let value = match (op, rec.metric_value) {
            (_, Some(v)) => v,
            (RowOp::Delete, None) => 0.0,
            (RowOp::Upsert, None) => {
                out.dropped_invalid += 1;
                continue;
            }
        };

        let context = RowContext {
            timezone: non_empty(rec.timezone),
            utc_offset_min: parse_i32_lenient(rec.utc_offset_min.as_deref()),
            place_country: non_empty(rec.place_country),
            place_region: non_empty(rec.place_region),
            place_city: non_empty(rec.place_city),
        };
        if let Some(name) = context.timezone.as_deref()
            && let Ok(canonical) = tz::validate_zone_name(name)
        {
            *tz_votes.entry(canonical).or_insert(0) += 1;
        }

        rows.push(SampleRow {
            user_id: owner_id.to_string(),
            hk_uuid: non_empty(rec.hk_uuid),
            timestamp,
            end_ts: rec.end_ts.as_deref().and_then(tz::parse_ts_lenient),
            kind,
            value,
            unit: non_empty(rec.unit),
            created_at: rec
                .created_at
                .as_deref()
                .and_then(tz::parse_ts_lenient)
                .unwrap_or(now),
            op,
            source_bundle_id: non_empty(rec.source_bundle_id),
            source_name: non_empty(rec.source_name),
            source_version: non_empty(rec.source_version),
            was_user_entered: parse_bool_lenient(rec.was_user_entered.as_deref()),
            meta: context.to_json(),
        });
    }

    if foreign_owner_rows > 0 {
        warn!(
            owner_id,
            foreign_owner_rows, "batch rows claimed a different owner; stamping authenticated owner"
        );
    }

    // Retention is anchored to the newest timestamp present anywhere in the
    // batch, matching the client's rolling export window.
    let newest = rows.iter().filter_map(|r| r.timestamp).max();
    let cutoff = newest.map(|ts| ts - Duration::days(retention_days));

    let mut missing_identity = 0usize;
    for row in rows {
        match row.op {
            // Deletes always pass: age or an unparseable timestamp must never
            // suppress a tombstone.
            RowOp::Delete => {
                if row.hk_uuid.is_none() {
                    warn!("skipping delete row without external identity");
                    out.dropped_invalid += 1;
                    continue;
                }
            }
            RowOp::Upsert => {
                let Some(ts) = row.timestamp else {
                    out.dropped_invalid += 1;
                    continue;
                };
                if let Some(cutoff) = cutoff
                    && ts < cutoff
                {
                    out.dropped_by_retention += 1;
                    continue;
                }
                if row.hk_uuid.is_none() {
                    missing_identity += 1;
                    continue;
                }
            }
        }
        if row.is_event() {
            out.events.push(row);
        } else {
            out.metrics.push(row);
        }
    }

    if missing_identity > 0 {
        return Err(BatchError::MissingIdentity {
            count: missing_identity,
        });
    }

    out.dominant_timezone = tz_votes
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(name, _)| name);

    Ok(out)
}
