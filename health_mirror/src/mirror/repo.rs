//! SQLite implementation of the mirror repository.

use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::{QueryResult, SqliteConnection};

use crate::batch::SampleRow;
use crate::bucket::Granularity;
use crate::derived::{WORKOUT_DISTANCE_KM, WORKOUT_DURATION_MIN, WORKOUT_ENERGY_KCAL};
use crate::mirror::{AppliedWrites, MirrorRepo, RepoResult, WorkoutBase};
use crate::models::{EventRow, MetricRow, NewEventRow, NewMetricRow};
use crate::rollup::BucketAggregate;
use crate::schema::health_events::dsl as he;
use crate::schema::health_metrics::dsl as hm;
use crate::tz;

diesel::define_sql_function! {
    /// SQL COALESCE over two nullable operands; used for last-non-null-wins merges.
    #[sql_name = "COALESCE"]
    fn coalesce<T: diesel::sql_types::SingleValue>(
        a: diesel::sql_types::Nullable<T>,
        b: diesel::sql_types::Nullable<T>,
    ) -> diesel::sql_types::Nullable<T>;
}

/// Repository applying mirror writes to the SQLite tables.
pub struct SqliteRepo;

impl SqliteRepo {
    /// Create the repository handle.
    pub fn new() -> Self {
        Self
    }
}

impl Default for SqliteRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn fmt_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(tz::to_rfc3339_millis)
}

// Merge-on-conflict for one event row. value/timestamp always take the incoming
// side; optional fields keep the stored value unless the incoming one is
// non-null; a successful upsert always clears the tombstone.
fn upsert_event_row(conn: &mut SqliteConnection, new_row: &NewEventRow<'_>) -> QueryResult<usize> {
    diesel::insert_into(he::health_events)
        .values(new_row)
        .on_conflict((he::user_id, he::hk_uuid, he::event_type))
        .do_update()
        .set((
            he::timestamp.eq(excluded(he::timestamp)),
            he::end_ts.eq(coalesce(excluded(he::end_ts), he::end_ts)),
            he::value.eq(excluded(he::value)),
            he::unit.eq(coalesce(excluded(he::unit), he::unit)),
            he::source_bundle_id.eq(coalesce(excluded(he::source_bundle_id), he::source_bundle_id)),
            he::source_name.eq(coalesce(excluded(he::source_name), he::source_name)),
            he::source_version.eq(coalesce(excluded(he::source_version), he::source_version)),
            he::was_user_entered.eq(coalesce(
                excluded(he::was_user_entered),
                he::was_user_entered,
            )),
            he::meta.eq(coalesce(excluded(he::meta), he::meta)),
            he::deleted_at.eq(None::<String>),
        ))
        .execute(conn)
}

impl MirrorRepo for SqliteRepo {
    fn upsert_metrics(
        &self,
        conn: &mut SqliteConnection,
        rows: &[SampleRow],
    ) -> RepoResult<AppliedWrites> {
        let mut applied = AppliedWrites::default();
        for row in rows {
            let ts = row.timestamp.context("metric upsert row without timestamp")?;
            let uuid = row
                .hk_uuid
                .as_deref()
                .context("metric upsert row without identity")?;

            let ts_s = tz::to_rfc3339_millis(ts);
            let end_s = fmt_opt(row.end_ts);
            let created_s = tz::to_rfc3339_millis(row.created_at);
            let new_row = NewMetricRow {
                user_id: &row.user_id,
                timestamp: &ts_s,
                end_ts: end_s.as_deref(),
                metric_type: &row.kind,
                metric_value: row.value,
                unit: row.unit.as_deref(),
                created_at: &created_s,
                hk_uuid: uuid,
                deleted_at: None,
                source_bundle_id: row.source_bundle_id.as_deref(),
                source_name: row.source_name.as_deref(),
                source_version: row.source_version.as_deref(),
                was_user_entered: row.was_user_entered,
                meta: row.meta.as_deref(),
            };

            diesel::insert_into(hm::health_metrics)
                .values(&new_row)
                .on_conflict((hm::user_id, hm::hk_uuid))
                .do_update()
                .set((
                    hm::timestamp.eq(excluded(hm::timestamp)),
                    hm::end_ts.eq(coalesce(excluded(hm::end_ts), hm::end_ts)),
                    hm::metric_type.eq(excluded(hm::metric_type)),
                    hm::metric_value.eq(excluded(hm::metric_value)),
                    hm::unit.eq(coalesce(excluded(hm::unit), hm::unit)),
                    hm::source_bundle_id
                        .eq(coalesce(excluded(hm::source_bundle_id), hm::source_bundle_id)),
                    hm::source_name.eq(coalesce(excluded(hm::source_name), hm::source_name)),
                    hm::source_version
                        .eq(coalesce(excluded(hm::source_version), hm::source_version)),
                    hm::was_user_entered.eq(coalesce(
                        excluded(hm::was_user_entered),
                        hm::was_user_entered,
                    )),
                    hm::meta.eq(coalesce(excluded(hm::meta), hm::meta)),
                    hm::deleted_at.eq(None::<String>),
                ))
                .execute(conn)
                .with_context(|| format!("upserting metric {uuid}"))?;

            applied.rows += 1;
            applied.touch_window(ts);
        }
        Ok(applied)
    }

    fn upsert_events(
        &self,
        conn: &mut SqliteConnection,
        rows: &[SampleRow],
    ) -> RepoResult<AppliedWrites> {
        let mut applied = AppliedWrites::default();
        for row in rows {
            let ts = row.timestamp.context("event upsert row without timestamp")?;
            let uuid = row
                .hk_uuid
                .as_deref()
                .context("event upsert row without identity")?;

            let ts_s = tz::to_rfc3339_millis(ts);
            let end_s = fmt_opt(row.end_ts);
            let created_s = tz::to_rfc3339_millis(row.created_at);
            let new_row = NewEventRow {
                user_id: &row.user_id,
                timestamp: &ts_s,
                end_ts: end_s.as_deref(),
                event_type: &row.kind,
                value: row.value,
                unit: row.unit.as_deref(),
                created_at: &created_s,
                hk_uuid: uuid,
                deleted_at: None,
                source_bundle_id: row.source_bundle_id.as_deref(),
                source_name: row.source_name.as_deref(),
                source_version: row.source_version.as_deref(),
                was_user_entered: row.was_user_entered,
                meta: row.meta.as_deref(),
            };

            upsert_event_row(conn, &new_row)
                .with_context(|| format!("upserting event {uuid}/{}", row.kind))?;

            applied.rows += 1;
            if row.kind.starts_with("workout_") {
                applied.workouts.insert(uuid.to_string());
            }
        }
        Ok(applied)
    }

    fn tombstone_metrics(
        &self,
        conn: &mut SqliteConnection,
        rows: &[SampleRow],
        deleted_at: DateTime<Utc>,
    ) -> RepoResult<AppliedWrites> {
        let mut applied = AppliedWrites::default();
        let stamp = tz::to_rfc3339_millis(deleted_at);
        for row in rows {
            let Some(uuid) = row.hk_uuid.as_deref() else {
                continue;
            };
            // Read the victims' timestamps first: a delete that empties a bucket
            // still has to widen the rollup recomputation window to cover it.
            let touched: Vec<String> = hm::health_metrics
                .filter(
                    hm::user_id
                        .eq(&row.user_id)
                        .and(hm::hk_uuid.eq(uuid))
                        .and(hm::deleted_at.is_null()),
                )
                .select(hm::timestamp)
                .load(conn)?;
            if touched.is_empty() {
                continue;
            }

            let n = diesel::update(
                hm::health_metrics.filter(
                    hm::user_id
                        .eq(&row.user_id)
                        .and(hm::hk_uuid.eq(uuid))
                        .and(hm::deleted_at.is_null()),
                ),
            )
            .set(hm::deleted_at.eq(&stamp))
            .execute(conn)
            .with_context(|| format!("tombstoning metric {uuid}"))?;

            applied.rows += n;
            for ts in &touched {
                let ts = tz::parse_ts_to_utc(ts)
                    .with_context(|| format!("stored timestamp on metric {uuid}"))?;
                applied.touch_window(ts);
            }
        }
        Ok(applied)
    }

    fn tombstone_events(
        &self,
        conn: &mut SqliteConnection,
        rows: &[SampleRow],
        deleted_at: DateTime<Utc>,
    ) -> RepoResult<AppliedWrites> {
        let mut applied = AppliedWrites::default();
        let stamp = tz::to_rfc3339_millis(deleted_at);
        for row in rows {
            let Some(uuid) = row.hk_uuid.as_deref() else {
                continue;
            };
            let n = diesel::update(
                he::health_events.filter(
                    he::user_id
                        .eq(&row.user_id)
                        .and(he::hk_uuid.eq(uuid))
                        .and(he::event_type.eq(&row.kind))
                        .and(he::deleted_at.is_null()),
                ),
            )
            .set(he::deleted_at.eq(&stamp))
            .execute(conn)
            .with_context(|| format!("tombstoning event {uuid}/{}", row.kind))?;

            applied.rows += n;
            if n > 0 && row.kind.starts_with("workout_") {
                applied.workouts.insert(uuid.to_string());
            }
        }
        Ok(applied)
    }

    fn load_workout_base(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        workout_uuid: &str,
    ) -> RepoResult<Option<WorkoutBase>> {
        let rows: Vec<EventRow> = he::health_events
            .filter(
                he::user_id
                    .eq(owner)
                    .and(he::hk_uuid.eq(workout_uuid))
                    .and(he::deleted_at.is_null())
                    .and(he::event_type.eq_any([
                        WORKOUT_DISTANCE_KM,
                        WORKOUT_DURATION_MIN,
                        WORKOUT_ENERGY_KCAL,
                    ])),
            )
            .select(EventRow::as_select())
            .load(conn)?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut start_ts: Option<DateTime<Utc>> = None;
        let mut base = WorkoutBase {
            workout_uuid: workout_uuid.to_string(),
            start_ts: DateTime::<Utc>::UNIX_EPOCH,
            end_ts: None,
            distance_km: None,
            duration_min: None,
            energy_kcal: None,
        };
        for row in rows {
            let ts = tz::parse_ts_to_utc(&row.timestamp)
                .with_context(|| format!("stored timestamp on workout {workout_uuid}"))?;
            start_ts = Some(start_ts.map_or(ts, |cur| cur.min(ts)));
            if let Some(end) = row.end_ts.as_deref() {
                let end = tz::parse_ts_to_utc(end)?;
                base.end_ts = Some(base.end_ts.map_or(end, |cur| cur.max(end)));
            }
            match row.event_type.as_str() {
                WORKOUT_DISTANCE_KM => base.distance_km = Some(row.value),
                WORKOUT_DURATION_MIN => base.duration_min = Some(row.value),
                WORKOUT_ENERGY_KCAL => base.energy_kcal = Some(row.value),
                _ => {}
            }
        }
        let Some(start_ts) = start_ts else {
            return Ok(None);
        };
        base.start_ts = start_ts;
        Ok(Some(base))
    }

    fn put_derived_flag(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        base: &WorkoutBase,
        flag: &str,
    ) -> RepoResult<()> {
        let uuid = format!("{}|{}", base.workout_uuid, flag);
        let ts_s = tz::to_rfc3339_millis(base.start_ts);
        let end_s = fmt_opt(base.end_ts);
        let created_s = tz::to_rfc3339_millis(Utc::now());
        let new_row = NewEventRow {
            user_id: owner,
            timestamp: &ts_s,
            end_ts: end_s.as_deref(),
            event_type: flag,
            value: 1.0,
            unit: None,
            created_at: &created_s,
            hk_uuid: &uuid,
            deleted_at: None,
            source_bundle_id: None,
            source_name: None,
            source_version: None,
            was_user_entered: None,
            meta: None,
        };
        upsert_event_row(conn, &new_row).with_context(|| format!("upserting derived {uuid}"))?;
        Ok(())
    }

    fn clear_derived_flag(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        workout_uuid: &str,
        flag: &str,
        deleted_at: DateTime<Utc>,
    ) -> RepoResult<()> {
        let uuid = format!("{workout_uuid}|{flag}");
        diesel::update(
            he::health_events.filter(
                he::user_id
                    .eq(owner)
                    .and(he::hk_uuid.eq(&uuid))
                    .and(he::event_type.eq(flag))
                    .and(he::deleted_at.is_null()),
            ),
        )
        .set(he::deleted_at.eq(tz::to_rfc3339_millis(deleted_at)))
        .execute(conn)
        .with_context(|| format!("tombstoning derived {uuid}"))?;
        Ok(())
    }

    fn load_metric_window(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> RepoResult<Vec<MetricRow>> {
        let t0 = tz::to_rfc3339_millis(window.0);
        let t1 = tz::to_rfc3339_millis(window.1);
        let rows = hm::health_metrics
            .filter(
                hm::user_id
                    .eq(owner)
                    .and(hm::deleted_at.is_null())
                    .and(hm::timestamp.ge(t0))
                    .and(hm::timestamp.lt(t1)),
            )
            .order(hm::timestamp.asc())
            .select(MetricRow::as_select())
            .load(conn)?;
        Ok(rows)
    }

    fn replace_rollup_range(
        &self,
        conn: &mut SqliteConnection,
        owner: &str,
        g: Granularity,
        window: (DateTime<Utc>, DateTime<Utc>),
        buckets: &[BucketAggregate],
    ) -> RepoResult<()> {
        let t0 = tz::to_rfc3339_millis(window.0);
        let t1 = tz::to_rfc3339_millis(window.1);
        match g {
            Granularity::Hour => {
                use crate::schema::health_rollup_hourly::dsl as hr;
                diesel::delete(
                    hr::health_rollup_hourly.filter(
                        hr::user_id
                            .eq(owner)
                            .and(hr::bucket_ts.ge(&t0))
                            .and(hr::bucket_ts.lt(&t1)),
                    ),
                )
                .execute(conn)?;
                for b in buckets {
                    diesel::insert_into(hr::health_rollup_hourly)
                        .values((
                            hr::user_id.eq(owner),
                            hr::metric_type.eq(&b.metric_type),
                            hr::bucket_ts.eq(tz::to_rfc3339_millis(b.bucket_ts)),
                            hr::avg_value.eq(b.avg_value),
                            hr::sum_value.eq(b.sum_value),
                            hr::min_value.eq(b.min_value),
                            hr::max_value.eq(b.max_value),
                            hr::n.eq(Some(b.n)),
                            hr::meta.eq(b.meta.as_deref()),
                        ))
                        .execute(conn)?;
                }
            }
            Granularity::Day => {
                use crate::schema::health_rollup_daily::dsl as dr;
                diesel::delete(
                    dr::health_rollup_daily.filter(
                        dr::user_id
                            .eq(owner)
                            .and(dr::bucket_ts.ge(&t0))
                            .and(dr::bucket_ts.lt(&t1)),
                    ),
                )
                .execute(conn)?;
                for b in buckets {
                    diesel::insert_into(dr::health_rollup_daily)
                        .values((
                            dr::user_id.eq(owner),
                            dr::metric_type.eq(&b.metric_type),
                            dr::bucket_ts.eq(tz::to_rfc3339_millis(b.bucket_ts)),
                            dr::avg_value.eq(b.avg_value),
                            dr::sum_value.eq(b.sum_value),
                            dr::min_value.eq(b.min_value),
                            dr::max_value.eq(b.max_value),
                            dr::n.eq(Some(b.n)),
                            dr::meta.eq(b.meta.as_deref()),
                        ))
                        .execute(conn)?;
                }
            }
        }
        Ok(())
    }
}
