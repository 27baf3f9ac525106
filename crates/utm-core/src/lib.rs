//! utm-core - Pure domain model, state machine, and conformance logic for the
//! flight-operation coordination engine.
//!
//! This crate has NO networking dependencies: it is deliberately safe to unit
//! test without a DSS, a database, or a running server.

pub mod conformance;
pub mod errors;
pub mod models;
pub mod spatial;
pub mod state_machine;

pub use conformance::ConformanceCode;
pub use errors::ValidationError;
pub use models::{
    DssTokenCacheEntry, FlightAuthorization, FlightDeclaration, FlightEvent, FlightOperationTracking,
    FlightState, Footprint, OperationType, OperationalIntentSnapshot, TaskSchedulerEntry,
    TelemetryObservation, Volume,
};
pub use state_machine::{is_legal_transition, operator_event_for_target, transition};
