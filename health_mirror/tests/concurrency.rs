mod common;
use common::{count_where, engine, payload, setup_db};

use std::sync::Arc;
use std::thread;

use diesel::prelude::*;
use health_mirror::db::connection::connect_sqlite;
use health_mirror::models::MetricRow;
use health_mirror::schema::health_metrics::dsl as hm;

#[test]
fn different_owners_apply_in_parallel_without_interference() {
    let (db, _conn) = setup_db();
    let eng = Arc::new(engine());

    let mut handles = Vec::new();
    for owner in ["owner-a", "owner-b"] {
        let eng = Arc::clone(&eng);
        let path = db.path.clone();
        handles.push(thread::spawn(move || {
            let mut conn = connect_sqlite(&path).expect("connect");
            let batch = payload(&format!(
                "timestamp,metric_type,metric_value,hk_uuid\n\
                 2024-05-01T10:05:00Z,heart_rate,60,{owner}-M1\n\
                 2024-05-01T10:10:00Z,steps,100,{owner}-M2\n"
            ));
            eng.ingest_batch(&mut conn, owner, &batch).expect("ingest")
        }));
    }
    for handle in handles {
        let report = handle.join().expect("thread");
        assert_eq!(report.mirrored, 2);
    }

    let mut conn = connect_sqlite(&db.path).expect("connect");
    assert_eq!(count_where(&mut conn, "health_metrics", "user_id = 'owner-a'"), 2);
    assert_eq!(count_where(&mut conn, "health_metrics", "user_id = 'owner-b'"), 2);
}

#[test]
fn same_owner_overlapping_upserts_lose_no_fields() {
    let (db, _conn) = setup_db();
    let eng = Arc::new(engine());

    // Two concurrent batches target the same identity, each carrying a
    // different optional field. Serialized per-owner application plus
    // last-non-null-wins merging must keep both fields whichever batch lands
    // last.
    let batches = [
        "timestamp,metric_type,metric_value,hk_uuid,unit\n\
         2024-05-01T10:05:00Z,heart_rate,60,M1,bpm\n",
        "timestamp,metric_type,metric_value,hk_uuid,source_name\n\
         2024-05-01T10:05:00Z,heart_rate,61,M1,Health\n",
    ];

    let mut handles = Vec::new();
    for csv_text in batches {
        let eng = Arc::clone(&eng);
        let path = db.path.clone();
        handles.push(thread::spawn(move || {
            let mut conn = connect_sqlite(&path).expect("connect");
            eng.ingest_batch(&mut conn, "owner-a", &payload(csv_text))
                .expect("ingest")
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().expect("thread").mirrored, 1);
    }

    let mut conn = connect_sqlite(&db.path).expect("connect");
    let row: MetricRow = hm::health_metrics
        .filter(hm::user_id.eq("owner-a").and(hm::hk_uuid.eq("M1")))
        .select(MetricRow::as_select())
        .first(&mut conn)
        .expect("M1");

    assert_eq!(row.unit.as_deref(), Some("bpm"));
    assert_eq!(row.source_name.as_deref(), Some("Health"));
    assert!(row.metric_value == 60.0 || row.metric_value == 61.0);
    assert_eq!(count_where(&mut conn, "health_metrics", "hk_uuid = 'M1'"), 1);
}
