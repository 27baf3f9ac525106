//! End-to-end orchestrator tests. Grounded in `atc-server`'s
//! `tests/{conflict,geofence,telemetry}_test.rs`, but built in-process
//! against a real `AppState`/`Orchestrator` over an in-memory SQLite
//! database rather than driving a live server over HTTP, so these run
//! deterministically without a DSS or network dependency.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use utm_core::{Footprint, OperationType, TelemetryObservation, Volume};
use utm_server::config::Config;
use utm_server::orchestrator::Orchestrator;
use utm_server::persistence::{declarations, init_database};
use utm_server::state::AppState;

fn test_config() -> Config {
    Config {
        server_port: 0,
        database_path: ":memory:".to_string(),
        database_max_connections: 1,
        admin_token: "test-admin-token".to_string(),
        dss_base_url: "http://localhost:8082".to_string(),
        dss_auth_url: "http://localhost:8085".to_string(),
        dss_auth_token_endpoint: "/oauth/token".to_string(),
        dss_client_id: String::new(),
        dss_client_secret: String::new(),
        dss_self_audience: "localhost".to_string(),
        blender_fqdn: "localhost".to_string(),
        heartbeat_rate_secs: 5,
        enable_conformance_monitoring: true,
        ussp_network_enabled: false,
        lock_watchdog_secs: 30,
        allowed_origins: vec![],
        rate_limit_enabled: false,
        rate_limit_rps: 100,
        tls_cert_path: None,
        tls_key_path: None,
        require_tls: false,
    }
}

async fn new_orchestrator() -> Orchestrator {
    let db = init_database(":memory:", 1).await.expect("in-memory db");
    let state = Arc::new(AppState::new(test_config(), Some(db)));
    Orchestrator::new(state)
}

fn rectangle(start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) -> Volume {
    Volume {
        footprint: Footprint::Polygon {
            points: vec![[46.98, 7.47], [46.98, 7.49], [46.99, 7.49], [46.99, 7.47], [46.98, 7.47]],
        },
        altitude_lower_m: 90.0,
        altitude_upper_m: 100.0,
        start,
        end,
    }
}

fn declaration_request(aircraft_id: &str, priority: u8, volume: Volume) -> utm_core::FlightDeclaration {
    let now = Utc::now();
    let mut declaration = utm_core::FlightDeclaration {
        id: Uuid::new_v4(),
        aircraft_id: aircraft_id.to_string(),
        originating_party: "acme".to_string(),
        submitted_by: "op@acme".to_string(),
        state: utm_core::FlightState::NotSubmitted,
        operation_type: OperationType::Bvlos,
        priority,
        volumes: vec![volume.clone()],
        off_nominal_volumes: vec![],
        start: volume.start,
        end: volume.end,
        bounds: (0.0, 0.0, 0.0, 0.0),
        latest_telemetry_datetime: None,
        created_at: now,
        updated_at: now,
    };
    declaration.recompute_bounds();
    declaration
}

fn observation(aircraft_id: &str, lat: f64, lng: f64, alt_m: f64, timestamp: chrono::DateTime<Utc>) -> TelemetryObservation {
    TelemetryObservation {
        aircraft_id: aircraft_id.to_string(),
        lat,
        lng,
        alt_m,
        timestamp,
        operational_status: "Airborne".to_string(),
        track_deg: None,
        speed_mps: None,
        vertical_speed_mps: None,
        accuracy_m: None,
        height_agl_m: None,
        operator_details: None,
    }
}

/// S1 — Accept, activate, end; no telemetry. States: 1 -> 2 -> 5, three
/// tracking entries, no scheduler entry left behind.
#[tokio::test]
async fn s1_accept_activate_end_with_no_telemetry() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let declaration = declaration_request("uas-1", 0, rectangle(now + chrono::Duration::minutes(1), now + chrono::Duration::minutes(4)));
    let id = declaration.id;

    let outcome = orchestrator.on_operator_submit(declaration).await.unwrap();
    assert_eq!(outcome.state, utm_core::FlightState::Accepted.code());

    let activated = orchestrator.on_operator_change_state(id, 2).await.unwrap();
    assert_eq!(activated.state, utm_core::FlightState::Activated);

    let ended = orchestrator.on_operator_change_state(id, 5).await.unwrap();
    assert_eq!(ended.state, utm_core::FlightState::Ended);

    let pool = orchestrator.state().database().unwrap().pool();
    let tracking = declarations::load_tracking_for_declaration(pool, id).await.unwrap();
    assert_eq!(tracking.len(), 3);
    assert_eq!(tracking[0].new_state, utm_core::FlightState::Accepted);
    assert_eq!(tracking[1].new_state, utm_core::FlightState::Activated);
    assert_eq!(tracking[2].new_state, utm_core::FlightState::Ended);

    assert!(orchestrator.state().kv.get::<utm_core::TaskSchedulerEntry>(&format!("scheduler.{id}")).unwrap().is_none());
}

/// S2 — Accept, activate, contingent, end. States: 1 -> 2 -> 4 -> 5.
#[tokio::test]
async fn s2_accept_activate_contingent_end() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let declaration = declaration_request("uas-2", 0, rectangle(now + chrono::Duration::minutes(1), now + chrono::Duration::minutes(10)));
    let id = declaration.id;

    orchestrator.on_operator_submit(declaration).await.unwrap();
    orchestrator.on_operator_change_state(id, 2).await.unwrap();
    let contingent = orchestrator.on_operator_change_state(id, 4).await.unwrap();
    assert_eq!(contingent.state, utm_core::FlightState::Contingent);
    let ended = orchestrator.on_operator_change_state(id, 5).await.unwrap();
    assert_eq!(ended.state, utm_core::FlightState::Ended);

    let pool = orchestrator.state().database().unwrap().pool();
    let tracking = declarations::load_tracking_for_declaration(pool, id).await.unwrap();
    assert_eq!(tracking.len(), 4);
}

/// S3 — Activated, then a telemetry point outside the declared volume raises
/// C7a and moves the declaration into Nonconforming.
#[tokio::test]
async fn s3_c7a_non_conformance_moves_to_nonconforming() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let volume = rectangle(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(10));
    let declaration = declaration_request("uas-3", 0, volume);
    let id = declaration.id;

    orchestrator.on_operator_submit(declaration).await.unwrap();

    {
        let pool = orchestrator.state().database().unwrap().pool();
        let mut tx = pool.begin().await.unwrap();
        declarations::upsert_authorization_tx(
            &mut tx,
            &utm_core::FlightAuthorization {
                declaration_id: id,
                dss_operational_intent_id: Some("opint-123".to_string()),
                created_at: now,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    orchestrator.on_operator_change_state(id, 2).await.unwrap();

    // Conforming telemetry first: stays Activated.
    orchestrator.on_telemetry(observation("uas-3", 46.985, 7.48, 95.0, Utc::now())).await.unwrap();
    let pool = orchestrator.state().database().unwrap().pool();
    let mid = declarations::load_declaration(pool, id).await.unwrap().unwrap();
    assert_eq!(mid.state, utm_core::FlightState::Activated);

    // Out-of-volume telemetry raises C7a.
    orchestrator.on_telemetry(observation("uas-3", 1.0, 1.0, 95.0, Utc::now())).await.unwrap();
    let after = declarations::load_declaration(pool, id).await.unwrap().unwrap();
    assert_eq!(after.state, utm_core::FlightState::Nonconforming);

    let tracking = declarations::load_tracking_for_declaration(pool, id).await.unwrap();
    assert!(tracking.iter().any(|t| t.notes.contains("C7a")));
}

/// S5 — operator attempts an unlisted target (Withdrawn=6): validation
/// error, no state change, no tracking entry.
#[tokio::test]
async fn s5_operator_cannot_set_disallowed_target() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let declaration = declaration_request("uas-5", 0, rectangle(now + chrono::Duration::minutes(1), now + chrono::Duration::minutes(4)));
    let id = declaration.id;

    orchestrator.on_operator_submit(declaration).await.unwrap();

    let result = orchestrator.on_operator_change_state(id, 6).await;
    assert!(result.is_err());

    let pool = orchestrator.state().database().unwrap().pool();
    let declaration = declarations::load_declaration(pool, id).await.unwrap().unwrap();
    assert_eq!(declaration.state, utm_core::FlightState::Accepted);

    let tracking = declarations::load_tracking_for_declaration(pool, id).await.unwrap();
    assert_eq!(tracking.len(), 1, "no tracking entry should be written for a rejected state request");
}

/// S6 — a declaration overlapping an existing Accepted priority-0 flight in
/// both bounds and time window self-deconflicts to Rejected.
#[tokio::test]
async fn s6_self_deconfliction_failure_rejects() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let window = (now + chrono::Duration::minutes(1), now + chrono::Duration::minutes(10));

    let first = declaration_request("uas-6a", 0, rectangle(window.0, window.1));
    orchestrator.on_operator_submit(first).await.unwrap();

    let second = declaration_request("uas-6b", 0, rectangle(window.0, window.1));
    let second_id = second.id;
    let outcome = orchestrator.on_operator_submit(second).await.unwrap();

    assert_eq!(outcome.state, utm_core::FlightState::Rejected.code());
    assert!(!outcome.is_approved);

    let pool = orchestrator.state().database().unwrap().pool();
    let tracking = declarations::load_tracking_for_declaration(pool, second_id).await.unwrap();
    assert_eq!(tracking.len(), 1);
    assert!(tracking[0].notes.to_lowercase().contains("conflict"));

    assert!(orchestrator.state().kv.get::<String>(&format!("pending_submission.{second_id}")).unwrap().is_none());
}

/// Round-trip law: submitting the same declaration id twice is idempotent.
#[tokio::test]
async fn submit_is_idempotent_on_declaration_id() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let declaration = declaration_request("uas-7", 0, rectangle(now + chrono::Duration::minutes(1), now + chrono::Duration::minutes(4)));
    let id = declaration.id;

    let first = orchestrator.on_operator_submit(declaration.clone()).await.unwrap();
    let second = orchestrator.on_operator_submit(declaration).await.unwrap();

    assert_eq!(first.state, second.state);

    let pool = orchestrator.state().database().unwrap().pool();
    let tracking = declarations::load_tracking_for_declaration(pool, id).await.unwrap();
    assert_eq!(tracking.len(), 1, "second submit must not write a duplicate tracking entry");
}

/// Invariant: Ended is terminal — a further operator command after Ended is
/// rejected rather than silently accepted.
#[tokio::test]
async fn ended_is_terminal_for_operator_commands() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let declaration = declaration_request("uas-8", 0, rectangle(now + chrono::Duration::minutes(1), now + chrono::Duration::minutes(4)));
    let id = declaration.id;

    orchestrator.on_operator_submit(declaration).await.unwrap();
    orchestrator.on_operator_change_state(id, 2).await.unwrap();
    orchestrator.on_operator_change_state(id, 5).await.unwrap();

    let result = orchestrator.on_operator_change_state(id, 2).await;
    assert!(result.is_err());

    let pool = orchestrator.state().database().unwrap().pool();
    let declaration = declarations::load_declaration(pool, id).await.unwrap().unwrap();
    assert_eq!(declaration.state, utm_core::FlightState::Ended);
}

/// A stale conformance signal racing a terminal state is dropped rather
/// than forced through an illegal transition.
#[tokio::test]
async fn conformance_signal_after_ended_is_dropped() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let declaration = declaration_request("uas-9", 0, rectangle(now + chrono::Duration::minutes(1), now + chrono::Duration::minutes(4)));
    let id = declaration.id;

    orchestrator.on_operator_submit(declaration).await.unwrap();
    orchestrator.on_operator_change_state(id, 2).await.unwrap();
    orchestrator.on_operator_change_state(id, 5).await.unwrap();

    orchestrator.on_conformance_signal(id, utm_core::ConformanceCode::C7a).await.unwrap();

    let pool = orchestrator.state().database().unwrap().pool();
    let declaration = declarations::load_declaration(pool, id).await.unwrap().unwrap();
    assert_eq!(declaration.state, utm_core::FlightState::Ended);
}

/// `onDSSEvent` for an opint we don't own is cached as a peer snapshot and
/// never drives our own declaration's state.
#[tokio::test]
async fn dss_event_for_unowned_opint_is_cached_as_peer_snapshot() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let snapshot = utm_core::OperationalIntentSnapshot {
        declaration_id: Uuid::new_v4(),
        opint_id: Some("peer-opint-1".to_string()),
        state: utm_core::FlightState::Activated,
        manager: Some("other-uss".to_string()),
        uss_availability: Some("Normal".to_string()),
        version: Some(1),
        ovn: Some("ovn-1".to_string()),
        start: now,
        end: now + chrono::Duration::minutes(5),
        uss_base_url: Some("https://peer.example.com".to_string()),
        subscription_id: None,
        volumes: vec![],
        off_nominal_volumes: vec![],
        priority: 0,
        bounds: (0.0, 0.0, 0.0, 0.0),
        subscribers: vec![],
        fetched_at: now,
    };

    orchestrator.on_dss_event("peer-opint-1", snapshot).unwrap();

    let cached: Option<utm_core::OperationalIntentSnapshot> =
        orchestrator.state().kv.get("flight_opint.peer.peer-opint-1").unwrap();
    assert!(cached.is_some());
}

/// S4 — Activated, telemetry was received once and then went stale for
/// more than 15s. First scheduled check raises C9a (`timeout`) and moves
/// the declaration straight to Contingent; a second scheduled check finds
/// it no longer `Activated` and leaves it alone.
#[tokio::test]
async fn s4_liveness_timeout_moves_to_contingent() {
    let orchestrator = new_orchestrator().await;
    let now = Utc::now();
    let declaration = declaration_request("uas-4", 0, rectangle(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(10)));
    let id = declaration.id;

    orchestrator.on_operator_submit(declaration).await.unwrap();

    {
        let pool = orchestrator.state().database().unwrap().pool();
        let mut tx = pool.begin().await.unwrap();
        declarations::upsert_authorization_tx(
            &mut tx,
            &utm_core::FlightAuthorization {
                declaration_id: id,
                dss_operational_intent_id: Some("opint-4".to_string()),
                created_at: now,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    orchestrator.on_operator_change_state(id, 2).await.unwrap();

    // Telemetry arrived once, then nothing for more than 15s.
    {
        let pool = orchestrator.state().database().unwrap().pool();
        let mut stale = declarations::load_declaration(pool, id).await.unwrap().unwrap();
        stale.latest_telemetry_datetime = Some(Utc::now() - chrono::Duration::seconds(20));
        let mut tx = pool.begin().await.unwrap();
        declarations::upsert_declaration_tx(&mut tx, &stale).await.unwrap();
        tx.commit().await.unwrap();
    }

    utm_server::jobs::check_flight_conformance(&orchestrator, id).await.unwrap();

    let pool = orchestrator.state().database().unwrap().pool();
    let declaration = declarations::load_declaration(pool, id).await.unwrap().unwrap();
    assert_eq!(declaration.state, utm_core::FlightState::Contingent, "C9a (stale telemetry) raises timeout");

    let tracking = declarations::load_tracking_for_declaration(pool, id).await.unwrap();
    assert!(tracking.iter().any(|t| t.notes.contains("C9a")));

    // Next scheduled check: no longer Activated, liveness check is a no-op.
    utm_server::jobs::check_flight_conformance(&orchestrator, id).await.unwrap();
    let after = declarations::load_declaration(pool, id).await.unwrap().unwrap();
    assert_eq!(after.state, utm_core::FlightState::Contingent);
}

/// Background conformance sweep (`jobs::check_flight_conformance`) detects
/// a liveness timeout the same way the immediate telemetry path would.
#[tokio::test]
async fn scheduled_conformance_check_detects_missing_liveness() {
    let orchestrator = Arc::new(new_orchestrator().await);
    let now = Utc::now();
    let declaration = declaration_request("uas-10", 0, rectangle(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(10)));
    let id = declaration.id;

    orchestrator.on_operator_submit(declaration).await.unwrap();

    {
        let pool = orchestrator.state().database().unwrap().pool();
        let mut tx = pool.begin().await.unwrap();
        declarations::upsert_authorization_tx(
            &mut tx,
            &utm_core::FlightAuthorization {
                declaration_id: id,
                dss_operational_intent_id: Some("opint-10".to_string()),
                created_at: now,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    orchestrator.on_operator_change_state(id, 2).await.unwrap();

    utm_server::jobs::check_flight_conformance(&orchestrator, id).await.unwrap();

    let pool = orchestrator.state().database().unwrap().pool();
    let declaration = declarations::load_declaration(pool, id).await.unwrap().unwrap();
    assert_eq!(declaration.state, utm_core::FlightState::Contingent, "C9b (no telemetry ever) raises BlenderConfirmsContingent");

    tokio::time::sleep(Duration::from_millis(1)).await;
}
