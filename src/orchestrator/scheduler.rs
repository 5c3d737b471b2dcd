//! Scheduler driver: one process-wide ticker firing the orchestrator every
//! 60 seconds.
//!
//! At most one tick runs at a time. Overruns are dropped, not queued: a
//! slow tick never doubles up, the ticker just skips to the next minute.

use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::clock::now_utc;
use crate::orchestrator::tick::run_tick;
use crate::state::AppState;

const TICK_INTERVAL: Duration = Duration::from_secs(60);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);
const PRUNE_INTERVAL: Duration = Duration::from_secs(86_400);

/// Spawn the per-minute tick loop.
pub fn spawn_tick_loop(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("⏰ Scheduler driver started (60s cadence)");
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            // Tick-level exclusion; a still-running tick drops this firing.
            let Ok(_guard) = state.tick_lock.try_lock() else {
                warn!("⏭️  Previous tick still running; dropping this one");
                continue;
            };

            if let Err(e) = run_tick(&state, now_utc()).await {
                warn!(error = %e, "orchestrator tick failed");
            }
        }
    })
}

/// Spawn the administrative sweep: stuck-run failover every five minutes,
/// terminal-run pruning and a vacuum pass daily.
pub fn spawn_maintenance_loop(state: AppState, db: crate::store::Db) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep_ticker = interval(MAINTENANCE_INTERVAL);
        sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut prune_ticker = interval(PRUNE_INTERVAL);
        prune_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sweep_ticker.tick() => {
                    let now = now_utc();
                    match state.queue.sweep_stuck(state.config.stuck_run_timeout_secs, now) {
                        Ok(0) => {}
                        Ok(n) => warn!(swept = n, "stuck runs failed over"),
                        Err(e) => warn!(error = %e, "stuck sweep failed"),
                    }
                }
                _ = prune_ticker.tick() => {
                    let now = now_utc();
                    match state.queue.prune_terminal(state.config.run_retention_days, now) {
                        Ok(deleted) if deleted > 0 => {
                            info!(deleted, retention_days = state.config.run_retention_days, "🧹 Pruned terminal runs");
                            if let Err(e) = db.optimize() {
                                warn!(error = %e, "db optimize failed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "run pruning failed"),
                    }
                }
            }
        }
    })
}
