//! Row <-> model conversion and CRUD for the three relational tables a
//! `FlightDeclaration` owns. Grounded in `flight_plans.rs`'s
//! `sqlx::FromRow` + `TryFrom` pattern: complex fields (volumes) are
//! JSON-serialized into TEXT columns, timestamps are RFC3339 strings.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use utm_core::{FlightAuthorization, FlightDeclaration, FlightOperationTracking, FlightState, OperationType, Volume};

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn operation_type_wire(kind: OperationType) -> &'static str {
    match kind {
        OperationType::Vlos => "VLOS",
        OperationType::Bvlos => "BVLOS",
        OperationType::Crewed => "CREWED",
    }
}

fn parse_operation_type(raw: &str) -> OperationType {
    match raw {
        "VLOS" => OperationType::Vlos,
        "CREWED" => OperationType::Crewed,
        _ => OperationType::Bvlos,
    }
}

#[derive(Debug, FromRow)]
struct DeclarationRow {
    id: String,
    aircraft_id: String,
    originating_party: String,
    submitted_by: String,
    state: i64,
    operation_type: String,
    priority: i64,
    volumes: String,
    off_nominal_volumes: String,
    start_time: String,
    end_time: String,
    min_lng: f64,
    min_lat: f64,
    max_lng: f64,
    max_lat: f64,
    latest_telemetry_datetime: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<DeclarationRow> for FlightDeclaration {
    type Error = serde_json::Error;

    fn try_from(row: DeclarationRow) -> Result<Self, Self::Error> {
        Ok(FlightDeclaration {
            id: Uuid::parse_str(&row.id).unwrap_or_else(|_| Uuid::nil()),
            aircraft_id: row.aircraft_id,
            originating_party: row.originating_party,
            submitted_by: row.submitted_by,
            state: FlightState::from_code(row.state as u8),
            operation_type: parse_operation_type(&row.operation_type),
            priority: row.priority as u8,
            volumes: serde_json::from_str(&row.volumes)?,
            off_nominal_volumes: serde_json::from_str(&row.off_nominal_volumes)?,
            start: parse_time(&row.start_time),
            end: parse_time(&row.end_time),
            bounds: (row.min_lng, row.min_lat, row.max_lng, row.max_lat),
            latest_telemetry_datetime: row.latest_telemetry_datetime.map(|raw| parse_time(&raw)),
            created_at: parse_time(&row.created_at),
            updated_at: parse_time(&row.updated_at),
        })
    }
}

/// Upserts a declaration inside an already-open transaction, so the caller
/// can commit the state change together with a tracking entry atomically.
pub async fn upsert_declaration_tx(
    tx: &mut Transaction<'_, Sqlite>,
    declaration: &FlightDeclaration,
) -> Result<(), sqlx::Error> {
    let volumes = serde_json::to_string(&declaration.volumes).unwrap_or_else(|_| "[]".to_string());
    let off_nominal = serde_json::to_string(&declaration.off_nominal_volumes).unwrap_or_else(|_| "[]".to_string());
    let (min_lng, min_lat, max_lng, max_lat) = declaration.bounds;

    sqlx::query(
        "INSERT INTO flight_declarations (
            id, aircraft_id, originating_party, submitted_by, state, operation_type, priority,
            volumes, off_nominal_volumes, start_time, end_time, min_lng, min_lat, max_lng, max_lat,
            latest_telemetry_datetime, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            aircraft_id = excluded.aircraft_id,
            originating_party = excluded.originating_party,
            submitted_by = excluded.submitted_by,
            state = excluded.state,
            operation_type = excluded.operation_type,
            priority = excluded.priority,
            volumes = excluded.volumes,
            off_nominal_volumes = excluded.off_nominal_volumes,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            min_lng = excluded.min_lng,
            min_lat = excluded.min_lat,
            max_lng = excluded.max_lng,
            max_lat = excluded.max_lat,
            latest_telemetry_datetime = excluded.latest_telemetry_datetime,
            updated_at = excluded.updated_at",
    )
    .bind(declaration.id.to_string())
    .bind(&declaration.aircraft_id)
    .bind(&declaration.originating_party)
    .bind(&declaration.submitted_by)
    .bind(declaration.state.code() as i64)
    .bind(operation_type_wire(declaration.operation_type))
    .bind(declaration.priority as i64)
    .bind(volumes)
    .bind(off_nominal)
    .bind(declaration.start.to_rfc3339())
    .bind(declaration.end.to_rfc3339())
    .bind(min_lng)
    .bind(min_lat)
    .bind(max_lng)
    .bind(max_lat)
    .bind(declaration.latest_telemetry_datetime.map(|dt| dt.to_rfc3339()))
    .bind(declaration.created_at.to_rfc3339())
    .bind(declaration.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn insert_tracking_entry_tx(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &FlightOperationTracking,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO flight_operation_tracking (declaration_id, original_state, new_state, notes, timestamp)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(entry.declaration_id.to_string())
    .bind(entry.original_state.code() as i64)
    .bind(entry.new_state.code() as i64)
    .bind(&entry.notes)
    .bind(entry.timestamp.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn upsert_authorization_tx(
    tx: &mut Transaction<'_, Sqlite>,
    authorization: &FlightAuthorization,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO flight_authorizations (declaration_id, dss_operational_intent_id, created_at)
         VALUES (?, ?, ?)
         ON CONFLICT(declaration_id) DO UPDATE SET
            dss_operational_intent_id = excluded.dss_operational_intent_id",
    )
    .bind(authorization.declaration_id.to_string())
    .bind(&authorization.dss_operational_intent_id)
    .bind(authorization.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn load_declaration(pool: &SqlitePool, id: Uuid) -> Result<Option<FlightDeclaration>, anyhow::Error> {
    let row = sqlx::query_as::<_, DeclarationRow>("SELECT * FROM flight_declarations WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(FlightDeclaration::try_from(row)?)),
        None => Ok(None),
    }
}

pub async fn load_all_declarations(pool: &SqlitePool) -> Result<Vec<FlightDeclaration>, anyhow::Error> {
    let rows = sqlx::query_as::<_, DeclarationRow>("SELECT * FROM flight_declarations").fetch_all(pool).await?;

    rows.into_iter()
        .map(|row| FlightDeclaration::try_from(row).map_err(anyhow::Error::from))
        .collect()
}

/// Declarations whose time window intersects `[start, end]` and whose
/// bounds intersect `viewport` — the two filters §6's list operation names.
pub async fn load_declarations_in_window(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    viewport: (f64, f64, f64, f64),
) -> Result<Vec<FlightDeclaration>, anyhow::Error> {
    let (vmin_lng, vmin_lat, vmax_lng, vmax_lat) = viewport;
    let rows = sqlx::query_as::<_, DeclarationRow>(
        "SELECT * FROM flight_declarations
         WHERE start_time <= ? AND end_time >= ?
           AND min_lng <= ? AND max_lng >= ?
           AND min_lat <= ? AND max_lat >= ?",
    )
    .bind(end.to_rfc3339())
    .bind(start.to_rfc3339())
    .bind(vmax_lng)
    .bind(vmin_lng)
    .bind(vmax_lat)
    .bind(vmin_lat)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| FlightDeclaration::try_from(row).map_err(anyhow::Error::from))
        .collect()
}

pub async fn load_authorization(pool: &SqlitePool, declaration_id: Uuid) -> Result<Option<FlightAuthorization>, anyhow::Error> {
    let row = sqlx::query(
        "SELECT declaration_id, dss_operational_intent_id, created_at FROM flight_authorizations WHERE declaration_id = ?",
    )
    .bind(declaration_id.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| FlightAuthorization {
        declaration_id: Uuid::parse_str(&row.get::<String, _>("declaration_id")).unwrap_or(declaration_id),
        dss_operational_intent_id: row.get("dss_operational_intent_id"),
        created_at: parse_time(&row.get::<String, _>("created_at")),
    }))
}

pub async fn load_tracking_for_declaration(
    pool: &SqlitePool,
    declaration_id: Uuid,
) -> Result<Vec<FlightOperationTracking>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT declaration_id, original_state, new_state, notes, timestamp
         FROM flight_operation_tracking WHERE declaration_id = ? ORDER BY id ASC",
    )
    .bind(declaration_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| FlightOperationTracking {
            declaration_id: Uuid::parse_str(&row.get::<String, _>("declaration_id")).unwrap_or(declaration_id),
            original_state: FlightState::from_code(row.get::<i64, _>("original_state") as u8),
            new_state: FlightState::from_code(row.get::<i64, _>("new_state") as u8),
            notes: row.get("notes"),
            timestamp: parse_time(&row.get::<String, _>("timestamp")),
        })
        .collect())
}

/// Deletes a declaration and every row it owns (authorization, tracking).
pub async fn delete_declaration(pool: &SqlitePool, declaration_id: Uuid) -> Result<(), anyhow::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM flight_operation_tracking WHERE declaration_id = ?")
        .bind(declaration_id.to_string())
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM flight_authorizations WHERE declaration_id = ?")
        .bind(declaration_id.to_string())
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM flight_declarations WHERE id = ?")
        .bind(declaration_id.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db::init_database;
    use utm_core::Footprint;

    fn declaration() -> FlightDeclaration {
        let now = Utc::now();
        FlightDeclaration {
            id: Uuid::new_v4(),
            aircraft_id: "uas-1".into(),
            originating_party: "acme".into(),
            submitted_by: "op@acme".into(),
            state: FlightState::Accepted,
            operation_type: OperationType::Bvlos,
            priority: 0,
            volumes: vec![Volume {
                footprint: Footprint::Polygon {
                    points: vec![[46.98, 7.47], [46.98, 7.49], [46.99, 7.49], [46.99, 7.47], [46.98, 7.47]],
                },
                altitude_lower_m: 90.0,
                altitude_upper_m: 100.0,
                start: now,
                end: now + chrono::Duration::minutes(5),
            }],
            off_nominal_volumes: vec![],
            start: now,
            end: now + chrono::Duration::minutes(5),
            bounds: (7.47, 46.98, 7.49, 46.99),
            latest_telemetry_datetime: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips() {
        let db = init_database(":memory:", 1).await.unwrap();
        let declaration = declaration();

        let mut tx = db.pool().begin().await.unwrap();
        upsert_declaration_tx(&mut tx, &declaration).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = load_declaration(db.pool(), declaration.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, declaration.id);
        assert_eq!(loaded.state, FlightState::Accepted);
        assert_eq!(loaded.volumes.len(), 1);
    }

    #[tokio::test]
    async fn tracking_entries_persist_in_order() {
        let db = init_database(":memory:", 1).await.unwrap();
        let declaration = declaration();

        let mut tx = db.pool().begin().await.unwrap();
        upsert_declaration_tx(&mut tx, &declaration).await.unwrap();
        insert_tracking_entry_tx(
            &mut tx,
            &FlightOperationTracking {
                declaration_id: declaration.id,
                original_state: FlightState::NotSubmitted,
                new_state: FlightState::Accepted,
                notes: "Created".into(),
                timestamp: Utc::now(),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let tracking = load_tracking_for_declaration(db.pool(), declaration.id).await.unwrap();
        assert_eq!(tracking.len(), 1);
        assert_eq!(tracking[0].notes, "Created");
    }

    #[tokio::test]
    async fn delete_cascades_owned_rows() {
        let db = init_database(":memory:", 1).await.unwrap();
        let declaration = declaration();

        let mut tx = db.pool().begin().await.unwrap();
        upsert_declaration_tx(&mut tx, &declaration).await.unwrap();
        tx.commit().await.unwrap();

        delete_declaration(db.pool(), declaration.id).await.unwrap();
        assert!(load_declaration(db.pool(), declaration.id).await.unwrap().is_none());
    }
}
