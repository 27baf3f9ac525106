//! Deconfliction Planner (component E). Combines the spatial index (B) and
//! KV-sourced operational-intent snapshots to decide whether a candidate
//! declaration may proceed, per §4.5's five-step procedure. Purely advisory:
//! actual airspace authority rests with the DSS.
//!
//! Grounded in `atc-core::spatial::check_plan_conflict` (temporal + spatial
//! overlap between two flight plans), generalized from waypoint-segment
//! proximity sampling to bbox/time-window overlap against indexed snapshots,
//! since the candidate is checked against many snapshots at once rather than
//! one other plan.

use uuid::Uuid;

use utm_core::{OperationalIntentSnapshot, Volume};

use crate::store::spatial_index::{Bbox, HitMetadata, SpatialIndex};

#[derive(Debug, Clone)]
pub struct DeconflictionOutcome {
    /// True iff the candidate passed self-deconfliction against priority-0
    /// dominated hits (step 2/3). False means the declaration must be
    /// recorded as Rejected without contacting the DSS.
    pub self_deconflicted: bool,
    /// False when any time-windowed geofence intersects the candidate. Does
    /// not block submission by itself (step 4).
    pub is_approved: bool,
    pub conflicting_declaration_ids: Vec<Uuid>,
}

/// Runs the full five-step procedure against a freshly built (and discarded)
/// spatial index. `active_snapshots` should already be filtered to the
/// flights the KV scan returned; `geofences` are time-windowed volumes.
pub fn check_candidate(
    candidate_bounds: Bbox,
    candidate_start: chrono::DateTime<chrono::Utc>,
    candidate_end: chrono::DateTime<chrono::Utc>,
    candidate_priority: u8,
    active_snapshots: &[OperationalIntentSnapshot],
    geofences: &[(Uuid, Volume)],
) -> DeconflictionOutcome {
    // Step 1: load active snapshots into a fresh, per-query R-tree.
    let mut index = SpatialIndex::new();
    for snapshot in active_snapshots {
        index.insert(
            snapshot.declaration_id,
            snapshot.bounds,
            HitMetadata {
                start_time: snapshot.start,
                end_time: snapshot.end,
                owner_id: snapshot.declaration_id.to_string(),
            },
        );
    }

    // Step 2: query with the candidate's own bounds.
    let hits = index.query_box(candidate_bounds);

    let priority_by_id: std::collections::HashMap<Uuid, u8> = active_snapshots
        .iter()
        .map(|s| (s.declaration_id, s.priority))
        .collect();

    let (self_deconflicted, conflicting_declaration_ids) = if candidate_priority == 0 && hits.is_empty() {
        (true, Vec::new())
    } else {
        // Step 3: temporal overlap + priority dominance.
        let mut conflicting = Vec::new();
        for hit in &hits {
            let overlaps = hit.metadata.start_time <= candidate_end && candidate_start <= hit.metadata.end_time;
            if !overlaps {
                continue;
            }
            let hit_priority = priority_by_id.get(&hit.id).copied().unwrap_or(0);
            let dominated = candidate_priority > hit_priority;
            if !dominated {
                conflicting.push(hit.id);
            }
        }
        (conflicting.is_empty(), conflicting)
    };

    // Step 4: geofence intersection forces is_approved = false without
    // blocking submission.
    let mut geofence_index = SpatialIndex::new();
    for (id, geofence) in geofences {
        if !geofence.time_overlaps(candidate_start, candidate_end) {
            continue;
        }
        geofence_index.insert(
            *id,
            geofence.bounds(),
            HitMetadata {
                start_time: geofence.start,
                end_time: geofence.end,
                owner_id: id.to_string(),
            },
        );
    }
    let geofence_hits = geofence_index.query_box(candidate_bounds);
    let is_approved = geofence_hits.is_empty();

    // Step 5: the indexes above are locals and are dropped at the end of
    // this call; nothing outlives the query.
    DeconflictionOutcome {
        self_deconflicted,
        is_approved,
        conflicting_declaration_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use utm_core::{FlightState, Footprint};

    fn snapshot(id: Uuid, bounds: Bbox, priority: u8, start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) -> OperationalIntentSnapshot {
        OperationalIntentSnapshot {
            declaration_id: id,
            opint_id: None,
            manager: None,
            uss_availability: None,
            version: None,
            state: FlightState::Activated,
            ovn: None,
            start,
            end,
            uss_base_url: None,
            subscription_id: None,
            volumes: Vec::new(),
            off_nominal_volumes: Vec::new(),
            priority,
            bounds,
            subscribers: Vec::new(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn priority_zero_self_deconflicts_with_no_hits() {
        let outcome = check_candidate(
            (7.47, 46.98, 7.49, 46.99),
            Utc::now(),
            Utc::now() + chrono::Duration::minutes(5),
            0,
            &[],
            &[],
        );
        assert!(outcome.self_deconflicted);
        assert!(outcome.conflicting_declaration_ids.is_empty());
    }

    #[test]
    fn overlapping_priority_zero_flights_conflict() {
        let now = Utc::now();
        let other_id = Uuid::new_v4();
        let snapshots = vec![snapshot(
            other_id,
            (7.47, 46.98, 7.49, 46.99),
            0,
            now,
            now + chrono::Duration::minutes(5),
        )];
        let outcome = check_candidate(
            (7.47, 46.98, 7.49, 46.99),
            now,
            now + chrono::Duration::minutes(5),
            0,
            &snapshots,
            &[],
        );
        assert!(!outcome.self_deconflicted);
        assert_eq!(outcome.conflicting_declaration_ids, vec![other_id]);
    }

    #[test]
    fn higher_priority_candidate_dominates_conflicting_hit() {
        let now = Utc::now();
        let other_id = Uuid::new_v4();
        let snapshots = vec![snapshot(
            other_id,
            (7.47, 46.98, 7.49, 46.99),
            0,
            now,
            now + chrono::Duration::minutes(5),
        )];
        let outcome = check_candidate(
            (7.47, 46.98, 7.49, 46.99),
            now,
            now + chrono::Duration::minutes(5),
            5,
            &snapshots,
            &[],
        );
        assert!(outcome.self_deconflicted);
    }

    #[test]
    fn non_overlapping_time_window_does_not_conflict() {
        let now = Utc::now();
        let other_id = Uuid::new_v4();
        let snapshots = vec![snapshot(
            other_id,
            (7.47, 46.98, 7.49, 46.99),
            0,
            now + chrono::Duration::hours(2),
            now + chrono::Duration::hours(3),
        )];
        let outcome = check_candidate(
            (7.47, 46.98, 7.49, 46.99),
            now,
            now + chrono::Duration::minutes(5),
            0,
            &snapshots,
            &[],
        );
        assert!(outcome.self_deconflicted);
    }

    #[test]
    fn geofence_intersection_forces_not_approved_without_blocking() {
        let now = Utc::now();
        let geofence_id = Uuid::new_v4();
        let geofence = Volume {
            footprint: Footprint::Polygon {
                points: vec![
                    [46.98, 7.47],
                    [46.98, 7.49],
                    [46.99, 7.49],
                    [46.99, 7.47],
                    [46.98, 7.47],
                ],
            },
            altitude_lower_m: 0.0,
            altitude_upper_m: 1000.0,
            start: now,
            end: now + chrono::Duration::minutes(5),
        };
        let outcome = check_candidate(
            (7.47, 46.98, 7.49, 46.99),
            now,
            now + chrono::Duration::minutes(5),
            0,
            &[],
            &[(geofence_id, geofence)],
        );
        assert!(outcome.self_deconflicted);
        assert!(!outcome.is_approved);
    }
}
