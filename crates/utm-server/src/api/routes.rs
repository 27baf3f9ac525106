//! Thin REST API: operator-facing declaration submission/state-change and
//! telemetry ingestion. Every handler validates just enough to deserialize,
//! then defers to the `Orchestrator` for everything else — no domain logic
//! lives here.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use utm_core::{FlightDeclaration, FlightState, OperationType, Volume};

use crate::api::auth::{rate_limit, require_admin, AdminToken, RateLimiter};
use crate::errors::OrchestratorError;
use crate::orchestrator::{Orchestrator, SubmitOutcome};
use crate::persistence::declarations;
use crate::state::AppState;

pub fn create_router(admin_token: AdminToken, rate_limiter: RateLimiter) -> Router<Arc<AppState>> {
    let admin_routes = Router::new()
        .route("/v1/admin/reset", post(admin_reset))
        .route_layer(middleware::from_fn_with_state(admin_token, require_admin));

    let telemetry_routes = Router::new()
        .route("/v1/telemetry", post(receive_telemetry))
        .route_layer(middleware::from_fn_with_state(rate_limiter, rate_limit));

    Router::new()
        .route("/v1/declarations", post(submit_declaration))
        .route("/v1/declarations", get(list_declarations))
        .route("/v1/declarations/:id", get(get_declaration))
        .route("/v1/declarations/:id/state", patch(change_declaration_state))
        .merge(telemetry_routes)
        .merge(admin_routes)
}

#[derive(Debug, Deserialize)]
pub struct SubmitDeclarationRequest {
    pub aircraft_id: String,
    pub originating_party: String,
    pub submitted_by: String,
    pub operation_type: OperationType,
    pub priority: u8,
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub off_nominal_volumes: Vec<Volume>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

async fn submit_declaration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitDeclarationRequest>,
) -> Result<(StatusCode, Json<SubmitOutcome>), OrchestratorError> {
    let now = Utc::now();
    let mut declaration = FlightDeclaration {
        id: Uuid::new_v4(),
        aircraft_id: req.aircraft_id,
        originating_party: req.originating_party,
        submitted_by: req.submitted_by,
        state: FlightState::NotSubmitted,
        operation_type: req.operation_type,
        priority: req.priority,
        volumes: req.volumes,
        off_nominal_volumes: req.off_nominal_volumes,
        start: req.start,
        end: req.end,
        bounds: (0.0, 0.0, 0.0, 0.0),
        latest_telemetry_datetime: None,
        created_at: now,
        updated_at: now,
    };
    declaration.recompute_bounds();

    let orchestrator = Orchestrator::new(state);
    let outcome = orchestrator.on_operator_submit(declaration).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct ChangeStateRequest {
    pub state: u8,
}

async fn change_declaration_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangeStateRequest>,
) -> Result<Json<FlightDeclaration>, OrchestratorError> {
    let orchestrator = Orchestrator::new(state);
    let declaration = orchestrator.on_operator_change_state(id, req.state).await?;
    Ok(Json(declaration))
}

async fn get_declaration(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<FlightDeclaration>, OrchestratorError> {
    let pool = state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool();
    let declaration = declarations::load_declaration(pool, id)
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?
        .ok_or(OrchestratorError::NotFound(id))?;
    Ok(Json(declaration))
}

#[derive(Debug, Deserialize)]
pub struct ListDeclarationsQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

async fn list_declarations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListDeclarationsQuery>,
) -> Result<Json<Vec<FlightDeclaration>>, OrchestratorError> {
    let pool = state.database().ok_or_else(|| OrchestratorError::Internal("no database configured".into()))?.pool();
    let viewport = (query.min_lng, query.min_lat, query.max_lng, query.max_lat);
    let results = declarations::load_declarations_in_window(pool, query.start, query.end, viewport)
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    Ok(Json(results))
}

#[derive(Debug, Serialize)]
struct TelemetryAck {
    accepted: bool,
}

async fn receive_telemetry(
    State(state): State<Arc<AppState>>,
    Json(observation): Json<utm_core::TelemetryObservation>,
) -> Result<(StatusCode, Json<TelemetryAck>), OrchestratorError> {
    let orchestrator = Orchestrator::new(state);
    orchestrator.on_telemetry(observation).await?;
    Ok((StatusCode::ACCEPTED, Json(TelemetryAck { accepted: true })))
}

/// Clears all declarations, authorizations, tracking history, and in-memory
/// store state. Gated behind `require_admin` middleware at the router-wrap
/// site, matching the teacher's demo-reset handler.
async fn admin_reset(State(state): State<Arc<AppState>>) -> Result<StatusCode, OrchestratorError> {
    if let Some(db) = state.database() {
        crate::persistence::db::clear_all(db.pool()).await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    }
    for key in state.kv.scan("", usize::MAX) {
        state.kv.delete(&key);
    }
    Ok(StatusCode::OK)
}
