//! Typed validation errors returned synchronously to callers. Never raised
//! via panic/unwrap in non-test code.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed declaration: {0}")]
    MalformedDeclaration(String),

    #[error("illegal state transition from {from:?} via {event:?}")]
    IllegalTransition {
        from: crate::models::FlightState,
        event: crate::models::FlightEvent,
    },

    #[error("operator may only set state to 2, 4, or 5")]
    OperatorTargetNotPermitted,

    #[error("time window out of allowed range: start={start}, end={end}")]
    TimeWindowOutOfRange { start: String, end: String },
}
