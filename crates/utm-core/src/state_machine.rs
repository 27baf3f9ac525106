//! Pure transition function over `{state, event}`. States are data (a tagged
//! enum), not one heap-allocated object per state — the table below is the
//! entire state machine.

use crate::models::{FlightEvent, FlightState};

/// Applies `event` to `state` per the declared transition table. Pairs not
/// listed in the table are no-ops: the state is returned unchanged. `Ended`
/// is terminal and absorbs every event; `Invalid` never transitions.
pub fn transition(state: FlightState, event: FlightEvent) -> FlightState {
    use FlightEvent::*;
    use FlightState::*;

    if state.is_terminal() || state == Invalid {
        return state;
    }

    match (state, event) {
        (NotSubmitted, DssAccepts) => Accepted,

        (Accepted, OperatorActivates) => Activated,
        (Accepted, OperatorConfirmsEnded) => Ended,
        (Accepted, UaDepartsEarlyLateOutsideOpIntent) => Nonconforming,

        (Activated, OperatorConfirmsEnded) => Ended,
        (Activated, UaExitsCoordinatedOpIntent) => Nonconforming,
        (Activated, OperatorInitiatesContingent) => Contingent,
        (Activated, BlenderConfirmsContingent) => Contingent,
        (Activated, Timeout) => Contingent,

        (Nonconforming, OperatorReturnToCoordinatedOpIntent) => Activated,
        (Nonconforming, OperatorConfirmsEnded) => Ended,
        (Nonconforming, Timeout) => Contingent,
        (Nonconforming, OperatorConfirmsContingent) => Contingent,

        (Contingent, OperatorConfirmsEnded) => Ended,

        _ => state,
    }
}

/// True iff `(state, event)` produces a state change per the transition
/// table — i.e. the pair is listed, as opposed to falling through to the
/// unchanged-state default.
pub fn is_legal_transition(state: FlightState, event: FlightEvent) -> bool {
    transition(state, event) != state
}

/// Operator-facing targets, keyed by the numeric state code the operator
/// requested (see §6: only 2, 4, 5 are permitted). Returns the event that
/// would drive the current state toward that target, or `None` if the
/// requested code is not an operator-reachable target.
pub fn operator_event_for_target(code: u8) -> Option<FlightEvent> {
    match code {
        2 => Some(FlightEvent::OperatorActivates),
        4 => Some(FlightEvent::OperatorInitiatesContingent),
        5 => Some(FlightEvent::OperatorConfirmsEnded),
        _ => None,
    }
}
