//! Scheduler/Worker jobs (G): background units of work driven by KV markers
//! and periodic ticks rather than inbound HTTP requests. Each job is a plain
//! async function that does one declaration's worth of work and returns;
//! `crate::loops` decides when and how often to call it.
//!
//! Grounded in `atc-server::loops::blender_sync_loop`'s per-item
//! fetch/transform/persist shape, generalized from "pull one Blender
//! resource into a local plan" to "push one declaration to the DSS" / "check
//! one declaration's conformance" / "fan out one status message".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use utm_core::{FlightAuthorization, FlightState, OperationalIntentSnapshot};
use utm_dss::{DssReference, PeerNotificationDetails, PeerNotificationPayload};

use crate::errors::OrchestratorError;
use crate::orchestrator::{write_opint_snapshot, Orchestrator};
use crate::persistence::declarations;

/// Value stored under `pending_submission.<id>`: carries enough state for
/// `flight_declaration_sync_loop` to enforce a bounded retry budget per
/// declaration rather than retrying forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub declaration_id: Uuid,
    pub attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
}

impl PendingSubmission {
    pub fn new(declaration_id: Uuid) -> Self {
        Self {
            declaration_id,
            attempts: 0,
            first_attempt_at: Utc::now(),
        }
    }
}

/// `submit_declaration_to_dss(declaration_id)` — §4.7 job 1.
///
/// Re-validates the submission window (a declaration can sit in the retry
/// queue for a while), calls the DSS Client, and on success writes the
/// operational-intent snapshot and fans out peer-USS notifications. Never
/// retries internally — the caller's queue decides whether a transient
/// [`OrchestratorError`] is worth another attempt.
pub async fn submit_declaration_to_dss(orchestrator: &Orchestrator, declaration_id: Uuid) -> Result<(), OrchestratorError> {
    let state = orchestrator.state();
    let pool = state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool();

    let Some(declaration) = declarations::load_declaration(pool, declaration_id)
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?
    else {
        return Ok(());
    };

    if declaration.state != FlightState::Accepted {
        // Moved on (activated, ended, rejected) since the marker was
        // written; nothing left for this job to push.
        return Ok(());
    }

    Orchestrator::validate_submit_window(&declaration)?;

    let submission = match state
        .dss
        .submit_operational_intent(declaration.state, &declaration.volumes, &declaration.off_nominal_volumes, declaration.priority)
        .await
    {
        Ok(submission) => submission,
        Err(err) => {
            // Transient errors (unreachable/timeout) are left for the sync
            // loop to retry within its bounded budget. Anything else -
            // auth failure, a 4xx, or a 409 airspace-key conflict - is
            // permanent for this declaration: reject it now rather than
            // leaving it stuck at Accepted forever.
            if !err.is_transient() {
                orchestrator
                    .reject_for_dss_failure(declaration.id, &format!("DSS submission rejected: {err}"))
                    .await?;
            }
            return Err(OrchestratorError::Dss(err));
        }
    };

    let authorization = FlightAuthorization {
        declaration_id: declaration.id,
        dss_operational_intent_id: Some(submission.opint_id.clone()),
        created_at: Utc::now(),
    };

    let mut tx = state
        .database()
        .ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?
        .pool()
        .begin()
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    declarations::upsert_authorization_tx(&mut tx, &authorization).await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    tx.commit().await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;

    let snapshot = OperationalIntentSnapshot {
        declaration_id: declaration.id,
        opint_id: Some(submission.opint_id.clone()),
        manager: Some(submission.dss_reference.manager.clone()),
        uss_availability: Some(submission.dss_reference.uss_availability.clone()),
        version: Some(submission.dss_reference.version),
        state: declaration.state,
        ovn: Some(submission.dss_reference.ovn.clone()),
        start: declaration.start,
        end: declaration.end,
        uss_base_url: Some(submission.dss_reference.uss_base_url.clone()),
        subscription_id: submission.dss_reference.subscription_id.clone(),
        volumes: declaration.volumes.clone(),
        off_nominal_volumes: declaration.off_nominal_volumes.clone(),
        priority: declaration.priority,
        bounds: declaration.bounds,
        subscribers: submission.subscribers.clone(),
        fetched_at: Utc::now(),
    };
    write_opint_snapshot(state, &declaration, &authorization, &snapshot)?;

    for subscriber in &submission.subscribers {
        let reference = DssReference {
            id: submission.opint_id.clone(),
            manager: submission.dss_reference.manager.clone(),
            uss_availability: submission.dss_reference.uss_availability.clone(),
            version: submission.dss_reference.version,
            ovn: submission.dss_reference.ovn.clone(),
            uss_base_url: submission.dss_reference.uss_base_url.clone(),
            subscription_id: submission.dss_reference.subscription_id.clone(),
        };
        let payload = PeerNotificationPayload {
            reference,
            details: PeerNotificationDetails {
                volumes: declaration.volumes.iter().flat_map(|v| v.ring()).collect(),
                priority: declaration.priority,
                off_nominal_volumes: declaration.off_nominal_volumes.iter().flat_map(|v| v.ring()).collect(),
            },
        };
        if let Err(err) = state.dss.notify_peer_uss(subscriber, &payload, subscriber).await {
            tracing::warn!("peer USS notification to {} failed after DSS submission: {}", subscriber, err);
        }
    }

    Ok(())
}

/// `check_flight_conformance(declaration_id)` — §4.7 job 2. Thin wrapper so
/// the scheduler loop and `Orchestrator::on_telemetry` share one conformance
/// code path.
pub async fn check_flight_conformance(orchestrator: &Orchestrator, declaration_id: Uuid) -> Result<(), OrchestratorError> {
    orchestrator.check_conformance(declaration_id).await
}

/// `send_operational_update_message(declaration_id, text, level)` — §4.7 job
/// 3. Records a tracking entry so the declaration's history carries
/// free-text operational notes (e.g. a manual annotation from an operator
/// dashboard) without driving a state transition.
pub async fn send_operational_update_message(
    orchestrator: &Orchestrator,
    declaration_id: Uuid,
    text: &str,
    level: &str,
) -> Result<(), OrchestratorError> {
    let state = orchestrator.state();
    let pool = state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool();
    let Some(declaration) = declarations::load_declaration(pool, declaration_id).await.map_err(|e| OrchestratorError::Internal(e.to_string()))? else {
        return Ok(());
    };

    let mut tx = state
        .database()
        .ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?
        .pool()
        .begin()
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    declarations::insert_tracking_entry_tx(
        &mut tx,
        &utm_core::FlightOperationTracking {
            declaration_id: declaration.id,
            original_state: declaration.state,
            new_state: declaration.state,
            notes: format!("[{level}] {text}"),
            timestamp: Utc::now(),
        },
    )
    .await
    .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    tx.commit().await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;

    Ok(())
}
