//! Domain model for the flight-operation coordination engine: declarations,
//! their DSS-facing authorization record, append-only tracking history, the
//! cached operational-intent snapshot, telemetry observations, and the
//! scheduler's per-declaration job descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::spatial::point_in_polygon;

/// Declared state of a flight declaration, numbered per the declared state
/// enum so wire/DB representations can round-trip through the integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightState {
    NotSubmitted = 0,
    Accepted = 1,
    Activated = 2,
    Nonconforming = 3,
    Contingent = 4,
    Ended = 5,
    Withdrawn = 6,
    Cancelled = 7,
    Rejected = 8,
    /// Not part of the declared state enum; the catch-all for an unknown
    /// numeric state. Never transitions.
    Invalid = 255,
}

impl FlightState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => FlightState::NotSubmitted,
            1 => FlightState::Accepted,
            2 => FlightState::Activated,
            3 => FlightState::Nonconforming,
            4 => FlightState::Contingent,
            5 => FlightState::Ended,
            6 => FlightState::Withdrawn,
            7 => FlightState::Cancelled,
            8 => FlightState::Rejected,
            _ => FlightState::Invalid,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FlightState::Ended)
    }
}

/// Events that drive the flight state machine. Names match the operator
/// commands, DSS responses, and telemetry-conformance signals that produce
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightEvent {
    DssAccepts,
    OperatorActivates,
    OperatorConfirmsEnded,
    UaDepartsEarlyLateOutsideOpIntent,
    UaExitsCoordinatedOpIntent,
    OperatorInitiatesContingent,
    BlenderConfirmsContingent,
    OperatorReturnToCoordinatedOpIntent,
    Timeout,
    OperatorConfirmsContingent,
}

/// Kind of crewed/uncrewed operation, carried on the declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Vlos,
    Bvlos,
    Crewed,
}

/// A single 4-D airspace volume: a polygon or buffered-circle footprint, an
/// altitude band in meters W84, and a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub footprint: Footprint,
    pub altitude_lower_m: f64,
    pub altitude_upper_m: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Footprint {
    /// Closed ring of `[lat, lon]` pairs, first == last.
    Polygon { points: Vec<[f64; 2]> },
    /// Buffered circle, converted to a polygon on demand for point-in-polygon
    /// checks (see `Volume::contains_point`).
    Circle {
        center_lat: f64,
        center_lon: f64,
        radius_m: f64,
    },
}

impl Volume {
    /// Ring of `[lat, lon]` points describing this volume's outline, whatever
    /// its underlying footprint.
    pub fn ring(&self) -> Vec<[f64; 2]> {
        match &self.footprint {
            Footprint::Polygon { points } => points.clone(),
            Footprint::Circle {
                center_lat,
                center_lon,
                radius_m,
            } => crate::spatial::circle_to_polygon(*center_lat, *center_lon, *radius_m, 24),
        }
    }

    pub fn contains_point(&self, lat: f64, lon: f64) -> bool {
        point_in_polygon(lat, lon, &self.ring())
    }

    pub fn contains_altitude(&self, alt_m: f64) -> bool {
        alt_m >= self.altitude_lower_m && alt_m <= self.altitude_upper_m
    }

    pub fn time_overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= end && start <= self.end
    }

    /// Axis-aligned bounding box of this volume's outline, as
    /// `(min_lng, min_lat, max_lng, max_lat)`.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let ring = self.ring();
        let mut min_lng = f64::MAX;
        let mut min_lat = f64::MAX;
        let mut max_lng = f64::MIN;
        let mut max_lat = f64::MIN;
        for [lat, lon] in ring {
            min_lat = min_lat.min(lat);
            max_lat = max_lat.max(lat);
            min_lng = min_lng.min(lon);
            max_lng = max_lng.max(lon);
        }
        (min_lng, min_lat, max_lng, max_lat)
    }
}

/// Operator-declared flight. Owns its authorization, tracking history,
/// operational-intent snapshot, and scheduler entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightDeclaration {
    pub id: Uuid,
    pub aircraft_id: String,
    pub originating_party: String,
    pub submitted_by: String,
    pub state: FlightState,
    pub operation_type: OperationType,
    pub priority: u8,
    pub volumes: Vec<Volume>,
    pub off_nominal_volumes: Vec<Volume>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bounds: (f64, f64, f64, f64),
    pub latest_telemetry_datetime: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlightDeclaration {
    /// Recomputes `bounds` as the union of every declared volume's bbox.
    pub fn recompute_bounds(&mut self) {
        let mut min_lng = f64::MAX;
        let mut min_lat = f64::MAX;
        let mut max_lng = f64::MIN;
        let mut max_lat = f64::MIN;
        for v in &self.volumes {
            let (vminlng, vminlat, vmaxlng, vmaxlat) = v.bounds();
            min_lng = min_lng.min(vminlng);
            min_lat = min_lat.min(vminlat);
            max_lng = max_lng.max(vmaxlng);
            max_lat = max_lat.max(vmaxlat);
        }
        self.bounds = (min_lng, min_lat, max_lng, max_lat);
    }
}

/// 1-to-1 with a `FlightDeclaration`; holds the DSS-assigned reference once
/// the DSS accepts the submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightAuthorization {
    pub declaration_id: Uuid,
    pub dss_operational_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only history entry. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightOperationTracking {
    pub declaration_id: Uuid,
    pub original_state: FlightState,
    pub new_state: FlightState,
    pub notes: String,
    pub timestamp: DateTime<Utc>,
}

/// Last-known DSS reference for an operational intent, cached in the KV
/// store under `flight_opint.<declaration_id>` with a 3-hour TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalIntentSnapshot {
    pub declaration_id: Uuid,
    pub opint_id: Option<String>,
    pub manager: Option<String>,
    pub uss_availability: Option<String>,
    pub version: Option<u32>,
    pub state: FlightState,
    pub ovn: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub uss_base_url: Option<String>,
    pub subscription_id: Option<String>,
    pub volumes: Vec<Volume>,
    pub off_nominal_volumes: Vec<Volume>,
    pub priority: u8,
    pub bounds: (f64, f64, f64, f64),
    pub subscribers: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// A single telemetry record appended to the `all_observations` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryObservation {
    pub aircraft_id: String,
    pub lat: f64,
    pub lng: f64,
    pub alt_m: f64,
    pub timestamp: DateTime<Utc>,
    pub operational_status: String,
    pub track_deg: Option<f64>,
    pub speed_mps: Option<f64>,
    pub vertical_speed_mps: Option<f64>,
    pub accuracy_m: Option<f64>,
    pub height_agl_m: Option<f64>,
    pub operator_details: Option<serde_json::Value>,
}

/// Per-declaration periodic-conformance job descriptor, kept alive for as
/// long as the declaration is being monitored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSchedulerEntry {
    pub declaration_id: Uuid,
    pub period: std::time::Duration,
    pub expires_at: DateTime<Utc>,
}

/// Cached OAuth2 credential for one `(audience, token_type)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DssTokenCacheEntry {
    pub credentials: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DssTokenCacheEntry {
    pub fn has_min_lifetime(&self, now: DateTime<Utc>, min_remaining: chrono::Duration) -> bool {
        self.expires_at - now >= min_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flight_state_round_trips_through_code() {
        for state in [
            FlightState::NotSubmitted,
            FlightState::Accepted,
            FlightState::Activated,
            FlightState::Nonconforming,
            FlightState::Contingent,
            FlightState::Ended,
            FlightState::Withdrawn,
            FlightState::Cancelled,
            FlightState::Rejected,
        ] {
            assert_eq!(FlightState::from_code(state.code()), state);
        }
    }

    #[test]
    fn unknown_code_maps_to_invalid() {
        assert_eq!(FlightState::from_code(200), FlightState::Invalid);
    }

    #[test]
    fn polygon_volume_contains_point() {
        let volume = Volume {
            footprint: Footprint::Polygon {
                points: vec![
                    [46.98, 7.47],
                    [46.98, 7.49],
                    [46.99, 7.49],
                    [46.99, 7.47],
                    [46.98, 7.47],
                ],
            },
            altitude_lower_m: 90.0,
            altitude_upper_m: 100.0,
            start: Utc::now(),
            end: Utc::now() + chrono::Duration::minutes(5),
        };
        assert!(volume.contains_point(46.985, 7.48));
        assert!(!volume.contains_point(1.0, 1.0));
        assert!(volume.contains_altitude(95.0));
        assert!(!volume.contains_altitude(101.0));
    }
}
