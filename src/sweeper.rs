// =============================================================================
// RESERVATION EXPIRY SWEEPER
// =============================================================================
// Background task that returns lapsed reservations to the pool and retires
// delivery tokens nobody used before they expired.
//
// LEARNING NOTES:
// - Each pass is a single batch UPDATE; units that lapse between passes are
//   simply picked up by the next one
// - A failing pass is logged and retried on the next tick. The sweeper never
//   takes the service down
// =============================================================================

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::Engine;
use crate::error::AppResult;
use crate::metrics;
use crate::models::SweepReport;

/// Releases every reservation that has lapsed. Returns the number of units
/// returned to `available`.
pub async fn sweep(engine: &Engine) -> AppResult<u64> {
    let mut tx = engine.begin().await?;
    let released = tx.release_expired(Utc::now()).await?;
    tx.commit().await?;

    if released > 0 {
        tracing::info!(released, "Expired reservations released");
        metrics::record_swept(released);
    }
    Ok(released)
}

/// Disables unrevealed tokens past their expiry.
pub async fn expire_stale_tokens(engine: &Engine) -> AppResult<u64> {
    let mut tx = engine.begin().await?;
    let expired = tx.expire_stale_tokens(Utc::now()).await?;
    tx.commit().await?;

    if expired > 0 {
        tracing::info!(expired, "Stale delivery tokens disabled");
    }
    Ok(expired)
}

/// One full maintenance pass.
pub async fn run_once(engine: &Engine) -> AppResult<SweepReport> {
    Ok(SweepReport {
        released_reservations: sweep(engine).await?,
        expired_tokens: expire_stale_tokens(engine).await?,
    })
}

/// Runs `run_once` every `interval` until the handle is aborted.
pub fn spawn(engine: Engine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = run_once(&engine).await {
                tracing::warn!(error = %e, "Maintenance pass failed, will retry");
            }
        }
    })
}
