//! Evaluates telemetry, liveness, and authorization state against a
//! declaration's envelope and returns a non-conformance code, or `None` for
//! conforming (`OK`). Never emits an event on `OK` — only non-OK codes
//! produce orchestrator signals.

use chrono::{DateTime, Utc};

use crate::models::{FlightDeclaration, FlightEvent, FlightState, TelemetryObservation};

const LIVENESS_TIMEOUT_SECS: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConformanceCode {
    C3,
    C4,
    C5,
    C6,
    C7a,
    C7b,
    C9a,
    C9b,
    C10,
    C11,
}

impl ConformanceCode {
    /// Event fed to the state machine when this code is raised.
    pub fn event(self) -> FlightEvent {
        match self {
            ConformanceCode::C3 => FlightEvent::BlenderConfirmsContingent,
            ConformanceCode::C4 | ConformanceCode::C5 => FlightEvent::BlenderConfirmsContingent,
            ConformanceCode::C6 => FlightEvent::UaDepartsEarlyLateOutsideOpIntent,
            ConformanceCode::C7a | ConformanceCode::C7b => FlightEvent::UaExitsCoordinatedOpIntent,
            ConformanceCode::C9a => FlightEvent::Timeout,
            ConformanceCode::C9b | ConformanceCode::C10 | ConformanceCode::C11 => {
                FlightEvent::BlenderConfirmsContingent
            }
        }
    }

    pub fn note(self) -> &'static str {
        match self {
            ConformanceCode::C3 => "C3: aircraft id mismatch",
            ConformanceCode::C4 => "C4: declaration not in an observable state",
            ConformanceCode::C5 => "C5: telemetry arrived outside Activated",
            ConformanceCode::C6 => "C6: telemetry timestamp outside declared time window",
            ConformanceCode::C7a => "C7a: position outside declared volumes",
            ConformanceCode::C7b => "C7b: altitude outside containing volume's band",
            ConformanceCode::C9a => "C9a: no telemetry in the last 15s",
            ConformanceCode::C9b => "C9b: no telemetry ever received",
            ConformanceCode::C10 => "C10: authorization check outside Activated/Nonconforming/Contingent",
            ConformanceCode::C11 => "C11: no FlightAuthorization row exists",
        }
    }
}

/// C3, C4, C5, C6, C7a, C7b — evaluated against a single telemetry sample.
pub fn check_telemetry(
    declaration: &FlightDeclaration,
    observation: &TelemetryObservation,
) -> Option<ConformanceCode> {
    if observation.aircraft_id != declaration.aircraft_id {
        return Some(ConformanceCode::C3);
    }

    if !matches!(
        declaration.state,
        FlightState::Accepted | FlightState::Activated | FlightState::Nonconforming
    ) {
        return Some(ConformanceCode::C4);
    }

    if declaration.state != FlightState::Activated {
        return Some(ConformanceCode::C5);
    }

    if observation.timestamp < declaration.start || observation.timestamp > declaration.end {
        return Some(ConformanceCode::C6);
    }

    let containing_volume = declaration
        .volumes
        .iter()
        .find(|v| v.contains_point(observation.lat, observation.lng));

    match containing_volume {
        None => Some(ConformanceCode::C7a),
        Some(volume) if !volume.contains_altitude(observation.alt_m) => Some(ConformanceCode::C7b),
        Some(_) => None,
    }
}

/// C9a, C9b — evaluated against liveness of the telemetry feed rather than a
/// single sample.
pub fn check_liveness(declaration: &FlightDeclaration, now: DateTime<Utc>) -> Option<ConformanceCode> {
    if declaration.state != FlightState::Activated {
        return None;
    }

    match declaration.latest_telemetry_datetime {
        None => Some(ConformanceCode::C9b),
        Some(last) => {
            if (now - last).num_seconds() > LIVENESS_TIMEOUT_SECS {
                Some(ConformanceCode::C9a)
            } else {
                None
            }
        }
    }
}

/// C10, C11 — evaluated whenever an authorization check is attempted.
pub fn check_authorization(declaration: &FlightDeclaration, has_authorization: bool) -> Option<ConformanceCode> {
    if !matches!(
        declaration.state,
        FlightState::Activated | FlightState::Nonconforming | FlightState::Contingent
    ) {
        return Some(ConformanceCode::C10);
    }

    if !has_authorization {
        return Some(ConformanceCode::C11);
    }

    None
}
