//! Periodic conformance sweep. Ticks every `heartbeat_rate_secs` and, for
//! each live `TaskSchedulerEntry` in the KV store, runs
//! `check_flight_conformance` against it — the same code path
//! `Orchestrator::on_telemetry` triggers on the fast path, just scheduled
//! instead of event-driven.
//!
//! Grounded in the teacher conformance loop's per-tick "scan every tracked
//! item, check one at a time" shape; the geofence-exit-waypoint computation
//! that loop did for HOLD/REROUTE commands has no counterpart here and is
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use utm_core::TaskSchedulerEntry;

use crate::jobs;
use crate::orchestrator::Orchestrator;

pub async fn run_conformance_loop(orchestrator: Arc<Orchestrator>, mut shutdown: broadcast::Receiver<()>) {
    let state = orchestrator.state().clone();
    let period = Duration::from_secs(state.config.heartbeat_rate_secs.max(1));
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                state.mark_loop_heartbeat("conformance");

                for key in state.kv.scan("scheduler.", 10_000) {
                    let Ok(Some(entry)) = state.kv.get::<TaskSchedulerEntry>(&key) else {
                        continue;
                    };
                    if Utc::now() > entry.expires_at {
                        state.kv.delete(&key);
                        continue;
                    }
                    if let Err(err) = jobs::check_flight_conformance(&orchestrator, entry.declaration_id).await {
                        tracing::warn!("conformance check failed for {}: {}", entry.declaration_id, err);
                    }
                }
            }
        }
    }
}
