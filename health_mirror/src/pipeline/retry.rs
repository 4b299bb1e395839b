//! Bounded retry with jittered backoff for transient storage conflicts.

use std::thread;
use std::time::Duration;

use rand::Rng as _;
use tracing::warn;

use crate::config::EngineConfig;
use crate::pipeline::IngestError;

/// Conflict signals that clear on their own once the competing writer finishes.
/// SQLite surfaces BUSY/LOCKED as "database is locked"; a server backend would
/// say "deadlock detected".
fn is_transient(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    msg.contains("database is locked")
        || msg.contains("database table is locked")
        || msg.contains("deadlock")
}

/// Run `f`, retrying transient failures up to the configured attempt cap.
///
/// Backoff grows linearly with the attempt number plus random jitter so
/// contending workers don't re-collide in lockstep. Non-transient errors
/// propagate immediately.
pub(crate) fn run<T>(
    cfg: &EngineConfig,
    op: &'static str,
    mut f: impl FnMut() -> anyhow::Result<T>,
) -> Result<T, IngestError> {
    let mut attempts = 0u32;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                attempts += 1;
                if attempts >= cfg.max_write_attempts {
                    return Err(IngestError::RetryExhausted {
                        op,
                        attempts,
                        cause: err,
                    });
                }
                let backoff_ms = cfg.backoff_base_ms.saturating_mul(u64::from(attempts))
                    + rand::rng().random_range(0..=cfg.backoff_base_ms);
                warn!(op, attempt = attempts, backoff_ms, "transient storage conflict; backing off");
                thread::sleep(Duration::from_millis(backoff_ms));
            }
            Err(err) => return Err(IngestError::Storage { op, cause: err }),
        }
    }
}
