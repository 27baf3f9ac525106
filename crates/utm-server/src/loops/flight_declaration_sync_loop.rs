//! DSS submission retry queue. Drains `pending_submission.<id>` KV markers
//! written by `Orchestrator::on_operator_submit` and hands each one to the
//! `submit_declaration_to_dss` job, backing off the whole queue on a
//! transient DSS failure rather than hammering it per-item.
//!
//! Grounded in the teacher sync loop's poll-the-remote-then-backoff-on-
//! failure shape, generalized from "sync one remote resource type" to
//! "drain one KV-backed retry queue".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::backoff::Backoff;
use crate::jobs::{self, PendingSubmission};
use crate::orchestrator::Orchestrator;

const TICK: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded retry budget per declaration (§7's "bounded retry; after
/// exhaustion declaration is marked Rejected"): whichever of attempt count
/// or elapsed time runs out first ends the retry.
const MAX_ATTEMPTS: u32 = 8;
const MAX_RETRY_AGE_SECS: i64 = 15 * 60;

pub async fn run_flight_declaration_sync_loop(orchestrator: Arc<Orchestrator>, mut shutdown: broadcast::Receiver<()>) {
    let state = orchestrator.state().clone();
    let mut backoff = Backoff::new(Duration::from_millis(500), MAX_BACKOFF);
    let mut ticker = tokio::time::interval(TICK);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                if !backoff.ready() {
                    continue;
                }
                state.mark_loop_heartbeat("flight-declaration-sync");

                let keys = state.kv.scan("pending_submission.", 100);
                let mut any_transient = false;

                for key in keys {
                    let Ok(Some(mut pending)) = state.kv.get::<PendingSubmission>(&key) else {
                        state.kv.delete(&key);
                        continue;
                    };
                    let declaration_id = pending.declaration_id;

                    match jobs::submit_declaration_to_dss(&orchestrator, declaration_id).await {
                        Ok(()) => {
                            state.kv.delete(&key);
                            backoff.reset();
                        }
                        Err(err) if err.is_retryable() => {
                            pending.attempts += 1;
                            let elapsed_secs = (Utc::now() - pending.first_attempt_at).num_seconds();
                            if pending.attempts >= MAX_ATTEMPTS || elapsed_secs >= MAX_RETRY_AGE_SECS {
                                tracing::error!(
                                    "DSS submission retry budget exhausted for {} after {} attempt(s): {}",
                                    declaration_id,
                                    pending.attempts,
                                    err
                                );
                                if let Err(reject_err) = orchestrator
                                    .reject_for_dss_failure(declaration_id, &format!("DSS submission retries exhausted: {err}"))
                                    .await
                                {
                                    tracing::error!("failed to reject {} after retry exhaustion: {}", declaration_id, reject_err);
                                }
                                state.kv.delete(&key);
                            } else {
                                tracing::warn!(
                                    "DSS submission retry {}/{} pending for {}: {}",
                                    pending.attempts,
                                    MAX_ATTEMPTS,
                                    declaration_id,
                                    err
                                );
                                let _ = state.kv.set(key, &pending, None);
                                any_transient = true;
                            }
                        }
                        Err(err) => {
                            // Permanent DSS error: submit_declaration_to_dss
                            // already rejected the declaration before
                            // returning it.
                            tracing::error!("DSS submission permanently failed for {}: {}", declaration_id, err);
                            state.kv.delete(&key);
                        }
                    }
                }

                if any_transient {
                    backoff.fail();
                }
            }
        }
    }
}
