//! Batch pipeline: per-owner serialization, transactional phases, error taxonomy.
//!
//! ## Phase order
//! `acquire owner lock → mutate events → mutate metrics → recompute derived →
//! commit raw → recompute hourly (own commit) → recompute daily (own commit) →
//! release lock`.
//!
//! ## Transactions & consistency
//! The raw mirror writes and the derived-flag recomputation share one
//! `BEGIN IMMEDIATE` transaction: a batch either fully commits its raw writes
//! or fails whole. Each rollup granularity commits separately *after* the raw
//! commit — a rollup failure never rolls back ingested data, it only leaves
//! buckets stale until the next batch touches the same window.
//!
//! ## Concurrency
//! One in-flight mutation sequence per owner, enforced by an owner-keyed lock
//! registry; batches for different owners proceed fully in parallel. Transient
//! storage conflicts are retried with jittered backoff around each phase, and
//! retry exhaustion fails the batch so the caller re-submits.

mod retry;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use diesel::{Connection, SqliteConnection};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::batch::{self, BatchError, RowOp, SampleRow};
use crate::bucket::Granularity;
use crate::config::EngineConfig;
use crate::derived;
use crate::mirror::MirrorRepo;
use crate::mirror::repo::SqliteRepo;
use crate::rollup;

/// Errors surfaced to the batch submitter.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The batch was rejected before any storage mutation.
    #[error(transparent)]
    Validation(#[from] BatchError),
    /// A write phase kept hitting transient conflicts and gave up. Nothing
    /// from the failed phase was committed; the caller should re-submit.
    #[error("{op} failed after {attempts} attempts: {cause:#}")]
    RetryExhausted {
        /// The phase that gave up.
        op: &'static str,
        /// How many attempts were made.
        attempts: u32,
        /// The last error observed.
        cause: anyhow::Error,
    },
    /// A non-transient storage failure.
    #[error("{op} failed: {cause:#}")]
    Storage {
        /// The phase that failed.
        op: &'static str,
        /// The underlying error.
        cause: anyhow::Error,
    },
}

/// What one batch ended up doing, reported back to the submitter.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Rows applied to the mirror tables (upserts plus matched tombstones).
    pub mirrored: usize,
    /// Event rows upserted.
    pub events_upserted: usize,
    /// Event rows tombstoned.
    pub events_tombstoned: usize,
    /// Metric rows upserted.
    pub metrics_upserted: usize,
    /// Metric rows tombstoned.
    pub metrics_tombstoned: usize,
    /// Upsert rows dropped by the retention window.
    pub dropped_by_retention: usize,
    /// Workouts whose derived-flag recomputation failed (logged, non-fatal).
    pub derived_failures: usize,
    /// False when the hourly rollup pass failed and buckets may lag.
    pub hourly_rollup_ok: bool,
    /// False when the daily rollup pass failed and buckets may lag.
    pub daily_rollup_ok: bool,
}

struct RawOutcome {
    events_upserted: usize,
    events_tombstoned: usize,
    metrics_upserted: usize,
    metrics_tombstoned: usize,
    metric_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    derived_failures: usize,
}

/// The ingestion engine: owns the per-owner lock registry and drives one
/// batch at a time per owner through the mirror, derived and rollup stages.
///
/// Connections are passed per call; the engine itself is cheap to share
/// behind an `Arc` across worker threads.
pub struct MirrorEngine {
    cfg: EngineConfig,
    repo: SqliteRepo,
    owner_locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl MirrorEngine {
    /// Create an engine with the given tunables.
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            repo: SqliteRepo::new(),
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    fn owner_lock(&self, owner: &str) -> Result<Arc<Mutex<()>>, IngestError> {
        let mut locks = self.owner_locks.lock().map_err(|_| IngestError::Storage {
            op: "owner lock registry",
            cause: anyhow::anyhow!("lock registry poisoned"),
        })?;

        // Prune dead weak refs opportunistically once the map grows.
        if locks.len() > 64 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(owner).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(owner.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }

    /// Ingest one batch for the authenticated `owner_id`.
    ///
    /// `payload_b64` is the queue payload: base64 over CSV bytes. Returns a
    /// report with the mirrored row count, or a structured error when the
    /// batch is invalid or a write phase exhausted its retries.
    pub fn ingest_batch(
        &self,
        conn: &mut SqliteConnection,
        owner_id: &str,
        payload_b64: &str,
    ) -> Result<IngestReport, IngestError> {
        let received_at = Utc::now();
        let normalized = batch::decode_and_normalize(
            payload_b64,
            owner_id,
            self.cfg.retention_days,
            received_at,
        )?;

        let mut report = IngestReport {
            dropped_by_retention: normalized.dropped_by_retention,
            hourly_rollup_ok: true,
            daily_rollup_ok: true,
            ..Default::default()
        };
        if normalized.is_empty() {
            info!(owner = owner_id, "batch normalized to zero rows; skipping storage");
            return Ok(report);
        }

        let lock = self.owner_lock(owner_id)?;
        let _guard = lock.lock().map_err(|_| IngestError::Storage {
            op: "owner lock",
            cause: anyhow::anyhow!("owner lock poisoned"),
        })?;

        let (event_deletes, event_upserts) = partition_ops(&normalized.events);
        let (metric_deletes, metric_upserts) = partition_ops(&normalized.metrics);

        let raw = retry::run(&self.cfg, "raw mirror write", || {
            conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                let now = Utc::now();
                let ev_del = self.repo.tombstone_events(conn, &event_deletes, now)?;
                let ev_up = self.repo.upsert_events(conn, &event_upserts)?;
                let m_del = self.repo.tombstone_metrics(conn, &metric_deletes, now)?;
                let m_up = self.repo.upsert_metrics(conn, &metric_upserts)?;

                let mut workouts: BTreeSet<String> = ev_del.workouts.clone();
                workouts.extend(ev_up.workouts.iter().cloned());
                let derived_failures =
                    derived::recompute_for_workouts(conn, &self.repo, owner_id, &workouts, now);

                Ok(RawOutcome {
                    events_upserted: ev_up.rows,
                    events_tombstoned: ev_del.rows,
                    metrics_upserted: m_up.rows,
                    metrics_tombstoned: m_del.rows,
                    metric_window: m_up.merge_window(&m_del),
                    derived_failures,
                })
            })
        })?;

        report.events_upserted = raw.events_upserted;
        report.events_tombstoned = raw.events_tombstoned;
        report.metrics_upserted = raw.metrics_upserted;
        report.metrics_tombstoned = raw.metrics_tombstoned;
        report.derived_failures = raw.derived_failures;
        report.mirrored = raw.events_upserted
            + raw.events_tombstoned
            + raw.metrics_upserted
            + raw.metrics_tombstoned;

        // Raw data is committed; rollups only degrade from here on.
        if let Some(window) = raw.metric_window {
            report.hourly_rollup_ok =
                self.recompute_rollup(conn, owner_id, window, Granularity::Hour);
            report.daily_rollup_ok =
                self.recompute_rollup(conn, owner_id, window, Granularity::Day);
        }

        info!(
            owner = owner_id,
            mirrored = report.mirrored,
            events = report.events_upserted + report.events_tombstoned,
            metrics = report.metrics_upserted + report.metrics_tombstoned,
            tz = normalized.dominant_timezone.as_deref().unwrap_or("UTC"),
            "batch mirrored"
        );
        Ok(report)
    }

    fn recompute_rollup(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
        g: Granularity,
    ) -> bool {
        let op = match g {
            Granularity::Hour => "hourly rollup",
            Granularity::Day => "daily rollup",
        };
        let outcome = retry::run(&self.cfg, op, || {
            conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                rollup::recompute(conn, &self.repo, owner, window, g)
            })
        });
        match outcome {
            Ok(buckets) => {
                debug!(owner, op, buckets, "rollup recomputed");
                true
            }
            Err(err) => {
                warn!(owner, op, error = %err, "rollup recomputation failed; buckets may lag");
                false
            }
        }
    }
}

fn partition_ops(rows: &[SampleRow]) -> (Vec<SampleRow>, Vec<SampleRow>) {
    rows.iter()
        .cloned()
        .partition(|row| row.op == RowOp::Delete)
}
