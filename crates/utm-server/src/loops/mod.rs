//! Supervised background loops (G). Each is restarted by
//! `main::spawn_supervised_loop` on panic or unexpected exit; none owns
//! state beyond what it reads from the shared `AppState`/`Orchestrator`.

pub mod conformance_loop;
pub mod flight_declaration_sync_loop;
pub mod operational_intent_expiry_loop;
