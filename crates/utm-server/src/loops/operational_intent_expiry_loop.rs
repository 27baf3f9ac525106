//! Housekeeping sweep: drops expired TTL entries from the KV store and
//! removes `TaskSchedulerEntry` rows whose declaration has outlived its
//! declared time window, so a declaration that never reaches `Ended` (e.g.
//! the operator vanishes) doesn't pin a scheduler entry forever.
//!
//! Grounded in the teacher expiry loop's transactional "sweep rows past
//! their expiry" shape, retargeted from SQL rows to KV entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use utm_core::TaskSchedulerEntry;

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_operational_intent_expiry_loop(state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                state.mark_loop_heartbeat("oi-expiry");
                state.kv.sweep_expired();

                let now = Utc::now();
                for key in state.kv.scan("scheduler.", 10_000) {
                    if let Ok(Some(entry)) = state.kv.get::<TaskSchedulerEntry>(&key) {
                        if now > entry.expires_at {
                            state.kv.delete(&key);
                        }
                    }
                }
            }
        }
    }
}
