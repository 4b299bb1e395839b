//! Rollup recomputation: hourly and daily materialized aggregates.
//!
//! The recomputation window covers every bucket touched by a batch's metric
//! upserts, widened by the timestamps of rows the batch tombstoned — a delete
//! that empties a bucket still forces that bucket's recomputation down to
//! absence. Within the window, buckets are replaced wholesale from the current
//! non-deleted rows; they are never incremented.

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::SqliteConnection;

use crate::bucket::{self, Granularity};
use crate::mirror::MirrorRepo;
use crate::models::MetricRow;
use crate::tz;

/// One (bucket, metric_type) aggregate group, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketAggregate {
    /// Bucket start instant (hour- or day-aligned UTC).
    pub bucket_ts: DateTime<Utc>,
    /// Metric category the bucket aggregates.
    pub metric_type: String,
    /// Mean of the bucket's values.
    pub avg_value: Option<f64>,
    /// Sum of the bucket's values.
    pub sum_value: Option<f64>,
    /// Smallest value in the bucket.
    pub min_value: Option<f64>,
    /// Largest value in the bucket.
    pub max_value: Option<f64>,
    /// Row count.
    pub n: i64,
    /// Context metadata of the most recent row that carried any.
    pub meta: Option<String>,
}

/// Recompute every bucket of granularity `g` that `window` touches.
///
/// The window is widened to bucket bounds, the current non-deleted rows are
/// re-aggregated in full, and the range's buckets are replaced. Returns the
/// number of buckets written.
pub fn recompute<R: MirrorRepo>(
    conn: &mut SqliteConnection,
    repo: &R,
    owner: &str,
    window: (DateTime<Utc>, DateTime<Utc>),
    g: Granularity,
) -> anyhow::Result<usize> {
    let start = bucket::truncate(window.0, g);
    let end = bucket::bucket_end_exclusive_utc(bucket::bucket_id(window.1, g), g);

    let rows = repo.load_metric_window(conn, owner, (start, end))?;
    let buckets = group_buckets(&rows, g)?;
    repo.replace_rollup_range(conn, owner, g, (start, end), &buckets)?;
    Ok(buckets.len())
}

struct Acc {
    sum: f64,
    min: f64,
    max: f64,
    n: i64,
    latest_meta: Option<(DateTime<Utc>, String)>,
}

fn group_buckets(rows: &[MetricRow], g: Granularity) -> anyhow::Result<Vec<BucketAggregate>> {
    let mut groups: BTreeMap<(i64, String), Acc> = BTreeMap::new();

    for row in rows {
        let ts = tz::parse_ts_to_utc(&row.timestamp)
            .with_context(|| format!("stored timestamp on metric row {}", row.id))?;
        let key = (bucket::bucket_id(ts, g), row.metric_type.clone());
        let acc = groups.entry(key).or_insert(Acc {
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            n: 0,
            latest_meta: None,
        });
        acc.sum += row.metric_value;
        acc.min = acc.min.min(row.metric_value);
        acc.max = acc.max.max(row.metric_value);
        acc.n += 1;
        if let Some(meta) = &row.meta
            && acc.latest_meta.as_ref().is_none_or(|(seen, _)| ts >= *seen)
        {
            acc.latest_meta = Some((ts, meta.clone()));
        }
    }

    Ok(groups
        .into_iter()
        .map(|((bucket_id, metric_type), acc)| BucketAggregate {
            bucket_ts: bucket::bucket_start_utc(bucket_id, g),
            metric_type,
            avg_value: Some(acc.sum / acc.n as f64),
            sum_value: Some(acc.sum),
            min_value: Some(acc.min),
            max_value: Some(acc.max),
            n: acc.n,
            meta: acc.latest_meta.map(|(_, m)| m),
        })
        .collect())
}
