//! Mirror writer: upsert/tombstone semantics over the raw tables.
//!
//! [`MirrorRepo`] is the storage-adapter seam — the pipeline, derived-fact and
//! rollup stages speak only this interface, and all SQL lives behind it in the
//! SQLite implementation ([`repo::SqliteRepo`]). Retry/backoff policy is NOT
//! applied here; the pipeline decorates whole phases instead, so the policy is
//! defined once.

pub mod repo;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use diesel::SqliteConnection;

use crate::batch::SampleRow;
use crate::bucket::Granularity;
use crate::rollup::BucketAggregate;

/// Result type used throughout the mirror repository for fallible operations.
pub type RepoResult<T> = anyhow::Result<T>;

/// What one write step actually touched, fed forward to the derived-fact and
/// rollup recomputers.
#[derive(Debug, Default)]
pub struct AppliedWrites {
    /// Rows written (upserted or tombstoned).
    pub rows: usize,
    /// Min/max timestamp of the touched rows. Only metric writes report this;
    /// it seeds the rollup recomputation window.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Workout identities touched. Only event writes report this.
    pub workouts: BTreeSet<String>,
}

impl AppliedWrites {
    pub(crate) fn touch_window(&mut self, ts: DateTime<Utc>) {
        self.window = Some(match self.window {
            None => (ts, ts),
            Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
        });
    }

    /// Widen this window to also cover `other`'s.
    pub fn merge_window(&self, other: &AppliedWrites) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.window, other.window) {
            (None, w) | (w, None) => w,
            (Some((a0, a1)), Some((b0, b1))) => Some((a0.min(b0), a1.max(b1))),
        }
    }
}

/// Current non-deleted base state of one workout, assembled from its event rows.
#[derive(Debug, Clone)]
pub struct WorkoutBase {
    /// The workout's external identity.
    pub workout_uuid: String,
    /// Earliest base-row instant.
    pub start_ts: DateTime<Utc>,
    /// Latest base-row interval end, when any row carries one.
    pub end_ts: Option<DateTime<Utc>>,
    /// Distance in kilometers, if mirrored.
    pub distance_km: Option<f64>,
    /// Duration in minutes, if mirrored.
    pub duration_min: Option<f64>,
    /// Active energy in kilocalories, if mirrored.
    pub energy_kcal: Option<f64>,
}

/// Portable surface; the SQLite implementation lives in `repo.rs`.
pub trait MirrorRepo {
    /// Apply upsert rows against the metrics table with field-level merge.
    fn upsert_metrics(
        &self,
        conn: &mut SqliteConnection,
        rows: &[SampleRow],
    ) -> RepoResult<AppliedWrites>;

    /// Apply upsert rows against the events table with field-level merge.
    fn upsert_events(
        &self,
        conn: &mut SqliteConnection,
        rows: &[SampleRow],
    ) -> RepoResult<AppliedWrites>;

    /// Tombstone non-deleted metric rows matching the delete rows' identities.
    fn tombstone_metrics(
        &self,
        conn: &mut SqliteConnection,
        rows: &[SampleRow],
        deleted_at: DateTime<Utc>,
    ) -> RepoResult<AppliedWrites>;

    /// Tombstone non-deleted event rows matching the delete rows' identities.
    fn tombstone_events(
        &self,
        conn: &mut SqliteConnection,
        rows: &[SampleRow],
        deleted_at: DateTime<Utc>,
    ) -> RepoResult<AppliedWrites>;

    /// Read a workout's current non-deleted base rows, `None` when all are gone.
    fn load_workout_base(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        workout_uuid: &str,
    ) -> RepoResult<Option<WorkoutBase>>;

    /// Upsert a derived flag row keyed `<workout_uuid>|<flag>`.
    fn put_derived_flag(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        base: &WorkoutBase,
        flag: &str,
    ) -> RepoResult<()>;

    /// Tombstone a derived flag row if it exists; a no-op otherwise.
    fn clear_derived_flag(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        workout_uuid: &str,
        flag: &str,
        deleted_at: DateTime<Utc>,
    ) -> RepoResult<()>;

    /// Load current non-deleted metric rows in `[window.0, window.1)`.
    fn load_metric_window(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> RepoResult<Vec<crate::models::MetricRow>>;

    /// Replace every rollup bucket in `[window.0, window.1)` with `buckets`.
    /// Buckets absent from `buckets` disappear — full replacement, not merge.
    fn replace_rollup_range(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        g: Granularity,
        window: (DateTime<Utc>, DateTime<Utc>),
        buckets: &[BucketAggregate],
    ) -> RepoResult<()>;
}
