//! Coordination Orchestrator (H): binds operator commands, DSS replies,
//! conformance signals, and telemetry to state transitions and side-effects.
//!
//! Grounded in how `atc-server::api::routes` + `state::AppState` divide
//! synchronous validation/persistence from asynchronous background work
//! (validate → persist → "accepted, processing continues"), generalized into
//! explicit methods callable from both the thin API layer and the job
//! workers rather than embedded directly in axum handlers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use utm_core::{
    is_legal_transition, operator_event_for_target, transition, ConformanceCode, FlightAuthorization, FlightDeclaration,
    FlightOperationTracking, FlightState, OperationalIntentSnapshot, TaskSchedulerEntry, TelemetryObservation, ValidationError,
    Volume,
};

use crate::deconfliction::{self, DeconflictionOutcome};
use crate::errors::OrchestratorError;
use crate::persistence::declarations;
use crate::state::AppState;
use crate::store::spatial_index::Bbox;

/// Matches §3's "TTL = 3 hours, refreshed on each DSS interaction".
const OPINT_SNAPSHOT_TTL: Duration = Duration::from_secs(3 * 3600);
/// §4.7 step 1's validation window; the same bound is enforced again on
/// every `submit_declaration_to_dss` attempt.
const MAX_FUTURE_SUBMIT: chrono::Duration = chrono::Duration::hours(48);
const SUBMIT_PAST_GRACE: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub id: Uuid,
    pub state: u8,
    pub is_approved: bool,
}

pub struct Orchestrator {
    state: Arc<AppState>,
}

impl Orchestrator {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    fn opint_key(declaration_id: Uuid) -> String {
        format!("flight_opint.{declaration_id}")
    }

    fn flightref_key(opint_id: &str) -> String {
        format!("opint_flightref.{opint_id}")
    }

    fn pending_submission_key(declaration_id: Uuid) -> String {
        format!("pending_submission.{declaration_id}")
    }

    fn scheduler_key(declaration_id: Uuid) -> String {
        format!("scheduler.{declaration_id}")
    }

    pub(crate) fn validate_submit_window(declaration: &FlightDeclaration) -> Result<(), ValidationError> {
        if declaration.start > declaration.end {
            return Err(ValidationError::TimeWindowOutOfRange {
                start: declaration.start.to_rfc3339(),
                end: declaration.end.to_rfc3339(),
            });
        }
        let now = Utc::now();
        if declaration.start < now - SUBMIT_PAST_GRACE || declaration.start > now + MAX_FUTURE_SUBMIT {
            return Err(ValidationError::TimeWindowOutOfRange {
                start: declaration.start.to_rfc3339(),
                end: declaration.end.to_rfc3339(),
            });
        }
        Ok(())
    }

    async fn active_snapshots(&self) -> Vec<OperationalIntentSnapshot> {
        self.state
            .kv
            .scan("flight_opint.", 10_000)
            .into_iter()
            .filter_map(|key| self.state.kv.get::<OperationalIntentSnapshot>(&key).ok().flatten())
            .collect()
    }

    fn active_geofences(&self) -> Vec<(Uuid, Volume)> {
        self.state
            .kv
            .scan("geofence.", 10_000)
            .into_iter()
            .filter_map(|key| {
                let volume: Volume = self.state.kv.get(&key).ok().flatten()?;
                let id_str = key.strip_prefix("geofence.")?;
                let id = Uuid::parse_str(id_str).ok()?;
                Some((id, volume))
            })
            .collect()
    }

    async fn persist_with_tracking(
        &self,
        declaration: &FlightDeclaration,
        original_state: FlightState,
        notes: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let db = self.state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?;
        let mut tx = db.pool().begin().await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        declarations::upsert_declaration_tx(&mut tx, declaration)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        declarations::insert_tracking_entry_tx(
            &mut tx,
            &FlightOperationTracking {
                declaration_id: declaration.id,
                original_state,
                new_state: declaration.state,
                notes: notes.into(),
                timestamp: Utc::now(),
            },
        )
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        tx.commit().await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        Ok(())
    }

    /// `onOperatorSubmit(declaration)`. Idempotent on `declaration.id`: a
    /// second submit of the same id returns the current persisted state
    /// without re-running deconfliction or writing a duplicate tracking
    /// entry.
    pub async fn on_operator_submit(&self, mut declaration: FlightDeclaration) -> Result<SubmitOutcome, OrchestratorError> {
        Self::validate_submit_window(&declaration)?;

        if let Some(existing) = declarations::load_declaration(
            self.state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool(),
            declaration.id,
        )
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?
        {
            return Ok(SubmitOutcome {
                id: existing.id,
                state: existing.state.code(),
                is_approved: existing.state != FlightState::Rejected,
            });
        }

        let snapshots = self.active_snapshots().await;
        let geofences = self.active_geofences();
        let candidate_bounds: Bbox = declaration.bounds;
        let outcome: DeconflictionOutcome = deconfliction::check_candidate(
            candidate_bounds,
            declaration.start,
            declaration.end,
            declaration.priority,
            &snapshots,
            &geofences,
        );

        let original_state = declaration.state;
        declaration.state = if outcome.self_deconflicted { FlightState::Accepted } else { FlightState::Rejected };
        declaration.updated_at = Utc::now();

        let notes = if outcome.self_deconflicted {
            "Created".to_string()
        } else {
            format!("Self-deconfliction failed against {} flight(s)", outcome.conflicting_declaration_ids.len())
        };
        self.persist_with_tracking(&declaration, original_state, notes).await?;

        if declaration.state == FlightState::Accepted {
            self.state
                .kv
                .set(Self::pending_submission_key(declaration.id), &crate::jobs::PendingSubmission::new(declaration.id), None)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        }

        Ok(SubmitOutcome {
            id: declaration.id,
            state: declaration.state.code(),
            is_approved: outcome.is_approved && declaration.state != FlightState::Rejected,
        })
    }

    /// Marks a declaration `Rejected` after a permanent DSS submission
    /// failure or retry-budget exhaustion (§7's `ConflictDSS(409)` /
    /// `Unreachable`/`Timeout`-exhaustion taxonomy). A no-op if the
    /// declaration already moved past `Accepted` by the time this runs.
    pub async fn reject_for_dss_failure(&self, declaration_id: Uuid, reason: &str) -> Result<(), OrchestratorError> {
        let pool = self.state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool();
        let Some(mut declaration) = declarations::load_declaration(pool, declaration_id).await.map_err(|e| OrchestratorError::Internal(e.to_string()))? else {
            return Ok(());
        };
        if declaration.state != FlightState::Accepted {
            return Ok(());
        }

        let original_state = declaration.state;
        declaration.state = FlightState::Rejected;
        declaration.updated_at = Utc::now();
        self.persist_with_tracking(&declaration, original_state, reason).await?;
        self.state.kv.delete(&Self::pending_submission_key(declaration_id));
        Ok(())
    }

    /// `onOperatorChangeState(declaration_id, new_state)`. Permitted targets
    /// are {2, 4, 5}; anything else is a validation error before any lock is
    /// even acquired.
    pub async fn on_operator_change_state(&self, declaration_id: Uuid, new_state_code: u8) -> Result<FlightDeclaration, OrchestratorError> {
        let event = operator_event_for_target(new_state_code).ok_or(ValidationError::OperatorTargetNotPermitted)?;

        let _guard = self
            .state
            .locks
            .acquire(declaration_id)
            .await
            .ok_or_else(|| OrchestratorError::Internal("declaration lock watchdog elapsed".into()))?;

        let pool = self.state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool();
        let mut declaration = declarations::load_declaration(pool, declaration_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            .ok_or(OrchestratorError::NotFound(declaration_id))?;

        if !is_legal_transition(declaration.state, event) {
            return Err(ValidationError::IllegalTransition {
                from: declaration.state,
                event,
            }
            .into());
        }

        let original_state = declaration.state;
        declaration.state = transition(declaration.state, event);
        declaration.updated_at = Utc::now();
        self.persist_with_tracking(&declaration, original_state, format!("Operator set state to {new_state_code}")).await?;

        self.apply_side_effects(&declaration).await?;

        Ok(declaration)
    }

    async fn apply_side_effects(&self, declaration: &FlightDeclaration) -> Result<(), OrchestratorError> {
        match declaration.state {
            FlightState::Activated => {
                if self.state.config.enable_conformance_monitoring {
                    let entry = TaskSchedulerEntry {
                        declaration_id: declaration.id,
                        period: Duration::from_secs(self.state.config.heartbeat_rate_secs),
                        expires_at: declaration.end,
                    };
                    self.state
                        .kv
                        .set(Self::scheduler_key(declaration.id), &entry, None)
                        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
                }
                self.update_dss_intent(declaration).await;
            }
            FlightState::Contingent => {
                self.update_dss_intent(declaration).await;
                self.notify_peers(declaration).await;
            }
            FlightState::Ended => {
                self.state.kv.delete(&Self::scheduler_key(declaration.id));
                self.update_dss_intent(declaration).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Best-effort: a DSS update failure here never rolls back the local
    /// state transition, matching §4.8's "notify the DSS" obligation being
    /// separate from the transition's atomicity guarantee.
    async fn update_dss_intent(&self, declaration: &FlightDeclaration) {
        let Ok(Some(snapshot)) = self.state.kv.get::<OperationalIntentSnapshot>(&Self::opint_key(declaration.id)) else {
            return;
        };
        let Some(opint_id) = snapshot.opint_id.as_deref() else {
            return;
        };
        let Some(ovn) = snapshot.ovn.as_deref() else {
            return;
        };

        match self
            .state
            .dss
            .update_operational_intent(opint_id, declaration.state, &declaration.volumes, ovn, snapshot.subscription_id.as_deref())
            .await
        {
            Ok(submission) => {
                let mut refreshed = snapshot;
                refreshed.state = declaration.state;
                refreshed.ovn = Some(submission.dss_reference.ovn);
                refreshed.version = Some(submission.dss_reference.version);
                refreshed.subscribers = submission.subscribers;
                refreshed.fetched_at = Utc::now();
                let _ = self.state.kv.set(Self::opint_key(declaration.id), &refreshed, Some(OPINT_SNAPSHOT_TTL));
            }
            Err(err) => {
                tracing::warn!("DSS intent update failed for {}: {}", declaration.id, err);
            }
        }
    }

    async fn notify_peers(&self, declaration: &FlightDeclaration) {
        let Ok(Some(snapshot)) = self.state.kv.get::<OperationalIntentSnapshot>(&Self::opint_key(declaration.id)) else {
            return;
        };
        for subscriber in &snapshot.subscribers {
            let reference = utm_dss::DssReference {
                id: snapshot.opint_id.clone().unwrap_or_default(),
                manager: snapshot.manager.clone().unwrap_or_default(),
                uss_availability: snapshot.uss_availability.clone().unwrap_or_default(),
                version: snapshot.version.unwrap_or(0),
                ovn: snapshot.ovn.clone().unwrap_or_default(),
                uss_base_url: snapshot.uss_base_url.clone().unwrap_or_default(),
                subscription_id: snapshot.subscription_id.clone(),
            };
            let payload = utm_dss::PeerNotificationPayload {
                reference,
                details: utm_dss::PeerNotificationDetails {
                    volumes: declaration.volumes.iter().flat_map(|v| v.ring()).collect(),
                    priority: declaration.priority,
                    off_nominal_volumes: declaration.off_nominal_volumes.iter().flat_map(|v| v.ring()).collect(),
                },
            };
            if let Err(err) = self.state.dss.notify_peer_uss(subscriber, &payload, subscriber).await {
                tracing::warn!("peer USS notification to {} failed: {}", subscriber, err);
            }
        }
    }

    /// `onTelemetry(observation)`.
    pub async fn on_telemetry(&self, observation: TelemetryObservation) -> Result<(), OrchestratorError> {
        self.state.stream.xadd(observation.clone()).await;

        let pool = self.state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool();
        let all = declarations::load_all_declarations(pool).await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let Some(mut declaration) = all
            .into_iter()
            .find(|d| d.aircraft_id == observation.aircraft_id && !d.state.is_terminal())
        else {
            return Ok(());
        };

        let original_state = declaration.state;
        declaration.latest_telemetry_datetime = Some(observation.timestamp);
        declaration.updated_at = Utc::now();
        self.persist_with_tracking(&declaration, original_state, "Telemetry received").await?;

        self.check_conformance(declaration.id).await
    }

    /// Runs the Conformance Engine against the latest stream telemetry for
    /// one declaration, and maps a non-OK code through `onConformanceSignal`.
    /// Shared by `onTelemetry` (immediate check) and the periodic scheduler
    /// job (`check_flight_conformance`).
    pub async fn check_conformance(&self, declaration_id: Uuid) -> Result<(), OrchestratorError> {
        let pool = self.state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool();
        let Some(declaration) = declarations::load_declaration(pool, declaration_id).await.map_err(|e| OrchestratorError::Internal(e.to_string()))? else {
            return Ok(());
        };
        if declaration.state.is_terminal() {
            self.state.kv.delete(&Self::scheduler_key(declaration_id));
            return Ok(());
        }

        // Checked in the order the code table lists them (telemetry, then
        // liveness, then authorization) so a tick where more than one
        // category would fire reports the same code the table lists first.
        let observation = self.state.stream.latest_for_aircraft(&declaration.aircraft_id).await;
        if let Some(observation) = &observation {
            if let Some(code) = utm_core::conformance::check_telemetry(&declaration, observation) {
                return self.on_conformance_signal(declaration_id, code).await;
            }
        }

        if let Some(code) = utm_core::conformance::check_liveness(&declaration, Utc::now()) {
            return self.on_conformance_signal(declaration_id, code).await;
        }

        let has_authorization = declarations::load_authorization(pool, declaration_id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
            .map(|auth| auth.dss_operational_intent_id.is_some())
            .unwrap_or(false);

        if let Some(code) = utm_core::conformance::check_authorization(&declaration, has_authorization) {
            return self.on_conformance_signal(declaration_id, code).await;
        }

        Ok(())
    }

    /// `onConformanceSignal(declaration_id, code)`.
    pub async fn on_conformance_signal(&self, declaration_id: Uuid, code: ConformanceCode) -> Result<(), OrchestratorError> {
        let event = code.event();

        let _guard = self
            .state
            .locks
            .acquire(declaration_id)
            .await
            .ok_or_else(|| OrchestratorError::Internal("declaration lock watchdog elapsed".into()))?;

        let pool = self.state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool();
        let Some(mut declaration) = declarations::load_declaration(pool, declaration_id).await.map_err(|e| OrchestratorError::Internal(e.to_string()))? else {
            return Ok(());
        };

        if !is_legal_transition(declaration.state, event) {
            // The conformance worker never forces an illegal move; a stale
            // signal racing a terminal state is simply dropped.
            return Ok(());
        }

        let original_state = declaration.state;
        declaration.state = transition(declaration.state, event);
        declaration.updated_at = Utc::now();
        self.persist_with_tracking(&declaration, original_state, code.note()).await?;

        if matches!(declaration.state, FlightState::Nonconforming | FlightState::Contingent) {
            self.update_dss_intent(&declaration).await;
            self.notify_peers(&declaration).await;
        }
        if declaration.state == FlightState::Ended {
            self.state.kv.delete(&Self::scheduler_key(declaration.id));
        }

        Ok(())
    }

    /// `onDSSEvent`. Peer-initiated operational-intent change notification.
    pub fn on_dss_event(&self, opint_id: &str, snapshot: OperationalIntentSnapshot) -> Result<(), OrchestratorError> {
        if self.state.kv.get::<String>(&Self::flightref_key(opint_id)).map_err(|e| OrchestratorError::Internal(e.to_string()))?.is_some() {
            // We own this intent; our own pipeline already applied the change.
            return Ok(());
        }
        self.state
            .kv
            .set(format!("flight_opint.peer.{opint_id}"), &snapshot, Some(OPINT_SNAPSHOT_TTL))
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        Ok(())
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }
}

/// Writes the two mutually-consistent KV entries §3 requires: the snapshot
/// itself and its opint-id cross-index. Used by `submit_declaration_to_dss`.
pub fn write_opint_snapshot(
    state: &AppState,
    declaration: &FlightDeclaration,
    authorization: &FlightAuthorization,
    snapshot: &OperationalIntentSnapshot,
) -> Result<(), OrchestratorError> {
    state
        .kv
        .set(format!("flight_opint.{}", declaration.id), snapshot, Some(OPINT_SNAPSHOT_TTL))
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    if let Some(opint_id) = authorization.dss_operational_intent_id.as_deref() {
        state
            .kv
            .set(format!("opint_flightref.{opint_id}"), &declaration.id.to_string(), Some(OPINT_SNAPSHOT_TTL))
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    }
    Ok(())
}
