//! Spatial index (component B): an R-tree over active flight/geofence
//! bounding boxes, rebuilt from KV snapshots before every deconfliction
//! query rather than incrementally maintained — per §4.2 the in-memory index
//! is local to the serving process and never the source of truth.
//!
//! Grounded in `atc-core::conflict::ConflictDetector` (tracks positions,
//! answers proximity queries) but re-expressed as a true spatial index via
//! `rstar`, since the teacher's detector is an O(n^2) HashMap scan rather
//! than a tree.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rstar::{RTree, RTreeObject, AABB};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
struct IndexedBox {
    key: u32,
    min: [f64; 2],
    max: [f64; 2],
}

impl RTreeObject for IndexedBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.min, self.max)
    }
}

#[derive(Debug, Clone)]
pub struct HitMetadata {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub owner_id: String,
}

#[derive(Debug, Clone)]
pub struct SpatialHit {
    pub id: Uuid,
    pub metadata: HitMetadata,
}

/// Bounding box as `(min_lng, min_lat, max_lng, max_lat)`.
pub type Bbox = (f64, f64, f64, f64);

/// Ephemeral, per-process R-tree. `rstar` objects need a comparable key, not
/// a UUID, so flight ids are hashed to a stable `u32` enumeration key (side
/// maps track the mapping) — mirrors the teacher's `drone_counter`-style
/// integer-id allocation.
pub struct SpatialIndex {
    tree: RTree<IndexedBox>,
    id_to_key: DashMap<Uuid, u32>,
    metadata: DashMap<u32, (Uuid, HitMetadata)>,
    next_key: AtomicU32,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self {
            tree: RTree::new(),
            id_to_key: DashMap::new(),
            metadata: DashMap::new(),
            next_key: AtomicU32::new(1),
        }
    }

    fn key_for(&self, id: Uuid) -> u32 {
        *self
            .id_to_key
            .entry(id)
            .or_insert_with(|| self.next_key.fetch_add(1, Ordering::SeqCst))
    }

    pub fn insert(&mut self, id: Uuid, bbox: Bbox, metadata: HitMetadata) {
        let key = self.key_for(id);
        let (min_lng, min_lat, max_lng, max_lat) = bbox;
        self.tree.insert(IndexedBox {
            key,
            min: [min_lng, min_lat],
            max: [max_lng, max_lat],
        });
        self.metadata.insert(key, (id, metadata));
    }

    pub fn delete(&mut self, id: Uuid, bbox: Bbox) {
        let Some(key) = self.id_to_key.get(&id).map(|k| *k) else {
            return;
        };
        let (min_lng, min_lat, max_lng, max_lat) = bbox;
        self.tree.remove(&IndexedBox {
            key,
            min: [min_lng, min_lat],
            max: [max_lng, max_lat],
        });
        self.metadata.remove(&key);
        self.id_to_key.remove(&id);
    }

    pub fn query_box(&self, bbox: Bbox) -> Vec<SpatialHit> {
        let (min_lng, min_lat, max_lng, max_lat) = bbox;
        let envelope = AABB::from_corners([min_lng, min_lat], [max_lng, max_lat]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|boxed| {
                self.metadata.get(&boxed.key).map(|entry| {
                    let (id, metadata) = entry.value();
                    SpatialHit {
                        id: *id,
                        metadata: metadata.clone(),
                    }
                })
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.tree = RTree::new();
        self.id_to_key.clear();
        self.metadata.clear();
        self.next_key.store(1, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(owner: &str) -> HitMetadata {
        let now = Utc::now();
        HitMetadata {
            start_time: now,
            end_time: now + chrono::Duration::minutes(5),
            owner_id: owner.to_string(),
        }
    }

    #[test]
    fn query_box_finds_overlapping_entry() {
        let mut index = SpatialIndex::new();
        let id = Uuid::new_v4();
        index.insert(id, (7.47, 46.98, 7.49, 46.99), meta("owner-a"));

        let hits = index.query_box((7.46, 46.97, 7.50, 47.00));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    #[test]
    fn query_box_misses_disjoint_entry() {
        let mut index = SpatialIndex::new();
        index.insert(Uuid::new_v4(), (7.47, 46.98, 7.49, 46.99), meta("owner-a"));

        let hits = index.query_box((100.0, 0.0, 101.0, 1.0));
        assert!(hits.is_empty());
    }

    #[test]
    fn delete_removes_entry() {
        let mut index = SpatialIndex::new();
        let id = Uuid::new_v4();
        index.insert(id, (7.47, 46.98, 7.49, 46.99), meta("owner-a"));
        index.delete(id, (7.47, 46.98, 7.49, 46.99));

        let hits = index.query_box((7.46, 46.97, 7.50, 47.00));
        assert!(hits.is_empty());
    }

    #[test]
    fn clear_empties_index() {
        let mut index = SpatialIndex::new();
        index.insert(Uuid::new_v4(), (7.47, 46.98, 7.49, 46.99), meta("owner-a"));
        index.clear();
        assert!(index.is_empty());
    }
}
