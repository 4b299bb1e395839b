mod common;
use common::{count_where, engine, payload, setup_db};

use diesel::SqliteConnection;
use diesel::prelude::*;
use health_mirror::models::EventRow;
use health_mirror::schema::health_events::dsl as he;

const OWNER: &str = "owner-a";

fn derived_row(conn: &mut SqliteConnection, workout: &str, flag: &str) -> Option<EventRow> {
    he::health_events
        .filter(
            he::user_id
                .eq(OWNER)
                .and(he::hk_uuid.eq(format!("{workout}|{flag}")))
                .and(he::event_type.eq(flag)),
        )
        .select(EventRow::as_select())
        .first(conn)
        .optional()
        .expect("query derived row")
}

fn live_flag(conn: &mut SqliteConnection, workout: &str, flag: &str) -> bool {
    derived_row(conn, workout, flag).is_some_and(|row| row.deleted_at.is_none())
}

#[test]
fn long_run_flag_follows_distance_across_batches() {
    let (_db, mut conn) = setup_db();
    let eng = engine();

    // 12 km: long run, but neither hard-workout predicate holds.
    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,event_type,metric_value,hk_uuid,unit\n\
             2024-05-01T07:00:00Z,workout_distance_km,12.0,W1,km\n\
             2024-05-01T07:00:00Z,workout_duration_min,55.0,W1,min\n\
             2024-05-01T07:00:00Z,workout_energy_kcal,650.0,W1,kcal\n",
        ),
    )
    .expect("seed workout");

    assert!(live_flag(&mut conn, "W1", "derived_long_run"));
    assert!(!live_flag(&mut conn, "W1", "derived_hard_workout"));
    assert!(derived_row(&mut conn, "W1", "derived_hard_workout").is_none());

    // Correcting the distance below the threshold retracts the flag.
    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,event_type,metric_value,hk_uuid,unit\n\
             2024-05-01T07:00:00Z,workout_distance_km,8.0,W1,km\n",
        ),
    )
    .expect("correct distance");

    assert!(!live_flag(&mut conn, "W1", "derived_long_run"));
    let row = derived_row(&mut conn, "W1", "derived_long_run").expect("tombstoned, not erased");
    assert!(row.deleted_at.is_some());

    // And raising it again resurrects the same derived identity.
    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,event_type,metric_value,hk_uuid,unit\n\
             2024-05-01T07:00:00Z,workout_distance_km,10.0,W1,km\n",
        ),
    )
    .expect("raise distance");
    assert!(live_flag(&mut conn, "W1", "derived_long_run"));
}

#[test]
fn hard_workout_flag_from_energy_or_duration() {
    let (_db, mut conn) = setup_db();
    let eng = engine();

    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,event_type,metric_value,hk_uuid\n\
             2024-05-01T07:00:00Z,workout_energy_kcal,900.0,W1\n\
             2024-05-02T07:00:00Z,workout_duration_min,75.0,W2\n\
             2024-05-03T07:00:00Z,workout_duration_min,30.0,W3\n",
        ),
    )
    .expect("ingest workouts");

    assert!(live_flag(&mut conn, "W1", "derived_hard_workout"));
    assert!(live_flag(&mut conn, "W2", "derived_hard_workout"));
    assert!(!live_flag(&mut conn, "W3", "derived_hard_workout"));
}

#[test]
fn deleting_the_base_tombstones_all_flags() {
    let (_db, mut conn) = setup_db();
    let eng = engine();

    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,event_type,metric_value,hk_uuid\n\
             2024-05-01T07:00:00Z,workout_distance_km,15.0,W1\n\
             2024-05-01T07:00:00Z,workout_duration_min,90.0,W1\n",
        ),
    )
    .expect("seed");
    assert!(live_flag(&mut conn, "W1", "derived_long_run"));
    assert!(live_flag(&mut conn, "W1", "derived_hard_workout"));

    eng.ingest_batch(
        &mut conn,
        OWNER,
        &payload(
            "timestamp,event_type,metric_value,hk_uuid,op\n\
             2024-05-01T07:00:00Z,workout_distance_km,,W1,delete\n\
             2024-05-01T07:00:00Z,workout_duration_min,,W1,delete\n",
        ),
    )
    .expect("delete base");

    assert!(!live_flag(&mut conn, "W1", "derived_long_run"));
    assert!(!live_flag(&mut conn, "W1", "derived_hard_workout"));
    // The base rows themselves are tombstones, not gone.
    assert_eq!(
        count_where(
            &mut conn,
            "health_events",
            "hk_uuid = 'W1' AND deleted_at IS NOT NULL"
        ),
        2
    );
}

#[test]
fn derived_rows_are_idempotent_under_reingestion() {
    let (_db, mut conn) = setup_db();
    let eng = engine();

    let batch = payload(
        "timestamp,event_type,metric_value,hk_uuid\n\
         2024-05-01T07:00:00Z,workout_distance_km,11.0,W1\n",
    );
    eng.ingest_batch(&mut conn, OWNER, &batch).expect("first");
    eng.ingest_batch(&mut conn, OWNER, &batch).expect("second");

    assert_eq!(
        count_where(
            &mut conn,
            "health_events",
            "event_type = 'derived_long_run' AND hk_uuid = 'W1|derived_long_run'"
        ),
        1
    );
}
