mod common;
use common::{count, engine, payload, setup_db};

use diesel::SqliteConnection;
use diesel::prelude::*;
use health_mirror::schema::health_rollup_daily::dsl as dr;
use health_mirror::schema::health_rollup_hourly::dsl as hr;

const OWNER: &str = "owner-a";

type BucketTuple = (
    Option<f64>, // avg
    Option<f64>, // sum
    Option<f64>, // min
    Option<f64>, // max
    Option<i64>, // n
    Option<String>,
);

fn hourly(conn: &mut SqliteConnection, metric: &str, bucket_ts: &str) -> Option<BucketTuple> {
    hr::health_rollup_hourly
        .filter(
            hr::user_id
                .eq(OWNER)
                .and(hr::metric_type.eq(metric))
                .and(hr::bucket_ts.eq(bucket_ts)),
        )
        .select((
            hr::avg_value,
            hr::sum_value,
            hr::min_value,
            hr::max_value,
            hr::n,
            hr::meta,
        ))
        .first(conn)
        .optional()
        .expect("hourly query")
}

fn daily(conn: &mut SqliteConnection, metric: &str, bucket_ts: &str) -> Option<BucketTuple> {
    dr::health_rollup_daily
        .filter(
            dr::user_id
                .eq(OWNER)
                .and(dr::metric_type.eq(metric))
                .and(dr::bucket_ts.eq(bucket_ts)),
        )
        .select((
            dr::avg_value,
            dr::sum_value,
            dr::min_value,
            dr::max_value,
            dr::n,
            dr::meta,
        ))
        .first(conn)
        .optional()
        .expect("daily query")
}

#[test]
fn buckets_equal_direct_recomputation() {
    let (_db, mut conn) = setup_db();
    let eng = engine();

    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,metric_type,metric_value,hk_uuid\n\
             2024-05-01T10:05:00Z,heart_rate,60,M1\n\
             2024-05-01T10:55:00Z,heart_rate,70,M2\n\
             2024-05-01T11:05:00Z,heart_rate,80,M3\n\
             2024-05-01T10:10:00Z,steps,120,M4\n",
        ),
    )
    .expect("ingest");

    let (avg, sum, min, max, n, _) =
        hourly(&mut conn, "heart_rate", "2024-05-01T10:00:00.000Z").expect("hr@10");
    assert_eq!(avg, Some(65.0));
    assert_eq!(sum, Some(130.0));
    assert_eq!(min, Some(60.0));
    assert_eq!(max, Some(70.0));
    assert_eq!(n, Some(2));

    let (_, _, _, _, n11, _) =
        hourly(&mut conn, "heart_rate", "2024-05-01T11:00:00.000Z").expect("hr@11");
    assert_eq!(n11, Some(1));

    let (avg_d, sum_d, min_d, max_d, n_d, _) =
        daily(&mut conn, "heart_rate", "2024-05-01T00:00:00.000Z").expect("hr daily");
    assert_eq!(avg_d, Some(70.0));
    assert_eq!(sum_d, Some(210.0));
    assert_eq!(min_d, Some(60.0));
    assert_eq!(max_d, Some(80.0));
    assert_eq!(n_d, Some(3));

    let (_, steps_sum, _, _, steps_n, _) =
        hourly(&mut conn, "steps", "2024-05-01T10:00:00.000Z").expect("steps@10");
    assert_eq!(steps_sum, Some(120.0));
    assert_eq!(steps_n, Some(1));
}

#[test]
fn reingesting_an_identity_replaces_not_inflates() {
    let (_db, mut conn) = setup_db();
    let eng = engine();

    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,metric_type,metric_value,hk_uuid\n\
             2024-05-01T10:05:00Z,steps,100,M1\n",
        ),
    )
    .expect("seed");
    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,metric_type,metric_value,hk_uuid\n\
             2024-05-01T10:05:00Z,steps,150,M1\n",
        ),
    )
    .expect("update");

    let (avg, sum, _, _, n, _) =
        hourly(&mut conn, "steps", "2024-05-01T10:00:00.000Z").expect("bucket");
    // One identity, recomputed wholesale: the bucket reflects the latest value only.
    assert_eq!(n, Some(1));
    assert_eq!(sum, Some(150.0));
    assert_eq!(avg, Some(150.0));
}

#[test]
fn deleting_sole_occupant_removes_the_bucket() {
    let (_db, mut conn) = setup_db();
    let eng = engine();

    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,metric_type,metric_value,hk_uuid\n\
             2024-05-01T09:30:00Z,steps,500,M1\n\
             2024-05-01T10:30:00Z,steps,200,M2\n",
        ),
    )
    .expect("seed");
    assert!(hourly(&mut conn, "steps", "2024-05-01T09:00:00.000Z").is_some());

    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,metric_type,metric_value,hk_uuid,op\n\
             2024-05-01T09:30:00Z,steps,,M1,delete\n",
        ),
    )
    .expect("delete");

    // The tombstoned row's timestamp widened the window, so its now-empty
    // bucket was recomputed down to absence.
    assert!(hourly(&mut conn, "steps", "2024-05-01T09:00:00.000Z").is_none());
    // The neighbouring bucket was untouched by the delete batch and survives.
    assert!(hourly(&mut conn, "steps", "2024-05-01T10:00:00.000Z").is_some());
    assert!(daily(&mut conn, "steps", "2024-05-01T00:00:00.000Z").is_some());
}

#[test]
fn bucket_meta_tracks_most_recent_context() {
    let (_db, mut conn) = setup_db();
    let eng = engine();

    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,metric_type,metric_value,hk_uuid,timezone\n\
             2024-05-01T10:05:00Z,steps,100,M1,America/Chicago\n\
             2024-05-01T10:45:00Z,steps,120,M2,America/New_York\n\
             2024-05-01T10:55:00Z,steps,130,M3,\n",
        ),
    )
    .expect("ingest");

    let (_, _, _, _, _, meta) =
        hourly(&mut conn, "steps", "2024-05-01T10:00:00.000Z").expect("bucket");
    assert!(meta.unwrap().contains("America/New_York"));
}

#[test]
fn event_only_batches_leave_rollups_alone() {
    let (_db, mut conn) = setup_db();
    let eng = engine();

    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,event_type,metric_value,hk_uuid\n\
             2024-05-01T07:00:00Z,workout_distance_km,12.0,W1\n",
        ),
    )
    .expect("ingest");

    assert_eq!(count(&mut conn, "health_rollup_hourly"), 0);
    assert_eq!(count(&mut conn, "health_rollup_daily"), 0);
}
