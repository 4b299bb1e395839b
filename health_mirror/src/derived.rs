//! Derived-fact recomputation for workouts.
//!
//! Whenever a batch touches a workout identity (upsert or delete of any of its
//! base event rows), the flags below are recomputed from the workout's current
//! non-deleted base state and upserted or tombstoned to match. The recomputation
//! is a pure function of base state: running it twice produces the same stored
//! result, and it never reads the batch itself.
//!
//! A failure for one workout is logged and skipped; derived flags are
//! enrichment data and must not block the raw mirror.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use diesel::SqliteConnection;
use tracing::warn;

use crate::mirror::{MirrorRepo, WorkoutBase};

/// Flag set iff the workout covered at least [`LONG_RUN_DISTANCE_KM`].
pub const LONG_RUN_FLAG: &str = "derived_long_run";
/// Flag set iff the workout burned [`HARD_WORKOUT_ENERGY_KCAL`] or ran
/// [`HARD_WORKOUT_DURATION_MIN`] or longer.
pub const HARD_WORKOUT_FLAG: &str = "derived_hard_workout";

/// Base event type carrying a workout's distance in kilometers.
pub const WORKOUT_DISTANCE_KM: &str = "workout_distance_km";
/// Base event type carrying a workout's duration in minutes.
pub const WORKOUT_DURATION_MIN: &str = "workout_duration_min";
/// Base event type carrying a workout's active energy in kilocalories.
pub const WORKOUT_ENERGY_KCAL: &str = "workout_energy_kcal";

/// Distance threshold for [`LONG_RUN_FLAG`], kilometers.
pub const LONG_RUN_DISTANCE_KM: f64 = 10.0;
/// Energy threshold for [`HARD_WORKOUT_FLAG`], kilocalories.
pub const HARD_WORKOUT_ENERGY_KCAL: f64 = 800.0;
/// Duration threshold for [`HARD_WORKOUT_FLAG`], minutes.
pub const HARD_WORKOUT_DURATION_MIN: f64 = 60.0;

fn is_long_run(base: &WorkoutBase) -> bool {
    base.distance_km.is_some_and(|d| d >= LONG_RUN_DISTANCE_KM)
}

fn is_hard_workout(base: &WorkoutBase) -> bool {
    base.energy_kcal
        .is_some_and(|e| e >= HARD_WORKOUT_ENERGY_KCAL)
        || base
            .duration_min
            .is_some_and(|d| d >= HARD_WORKOUT_DURATION_MIN)
}

/// Recompute both flags for every touched workout. Returns the number of
/// workouts whose recomputation failed (already logged).
pub fn recompute_for_workouts<R: MirrorRepo>(
    conn: &mut SqliteConnection,
    repo: &R,
    owner: &str,
    workouts: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> usize {
    let mut failures = 0usize;
    for workout_uuid in workouts {
        if let Err(err) = recompute_one(conn, repo, owner, workout_uuid, now) {
            failures += 1;
            warn!(
                owner,
                workout = %workout_uuid,
                error = %format!("{err:#}"),
                "derived flag recomputation failed; continuing"
            );
        }
    }
    failures
}

fn recompute_one<R: MirrorRepo>(
    conn: &mut SqliteConnection,
    repo: &R,
    owner: &str,
    workout_uuid: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    match repo.load_workout_base(conn, owner, workout_uuid)? {
        // Base fully gone: both flags lose their justification.
        None => {
            repo.clear_derived_flag(conn, owner, workout_uuid, LONG_RUN_FLAG, now)?;
            repo.clear_derived_flag(conn, owner, workout_uuid, HARD_WORKOUT_FLAG, now)?;
        }
        Some(base) => {
            for (flag, holds) in [
                (LONG_RUN_FLAG, is_long_run(&base)),
                (HARD_WORKOUT_FLAG, is_hard_workout(&base)),
            ] {
                if holds {
                    repo.put_derived_flag(conn, owner, &base, flag)?;
                } else {
                    repo.clear_derived_flag(conn, owner, workout_uuid, flag, now)?;
                }
            }
        }
    }
    Ok(())
}
