//! Ordered, append-only telemetry stream (`all_observations`). Grounded in
//! `AppState`'s `broadcast`-based telemetry fan-out, generalized from "one
//! subscriber" to named consumer groups each with an independent cursor, and
//! bounded by trim-to-newest rather than unbounded growth.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::RwLock;

use utm_core::TelemetryObservation;

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: u64,
    pub observation: TelemetryObservation,
}

/// Bounded ring buffer with `xadd`/`xrange`/`xtrim` and a named
/// consumer-group reader that yields each entry exactly once per group.
pub struct ObservationStream {
    entries: RwLock<VecDeque<StreamEntry>>,
    next_id: AtomicU64,
    max_entries: usize,
    group_cursors: DashMap<String, u64>,
}

impl ObservationStream {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            max_entries,
            group_cursors: DashMap::new(),
        }
    }

    /// Appends an observation and returns its stream id.
    pub async fn xadd(&self, observation: TelemetryObservation) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.write().await;
        entries.push_back(StreamEntry { id, observation });
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
        id
    }

    /// Entries with `start <= id <= end`, in append order.
    pub async fn xrange(&self, start: u64, end: u64) -> Vec<StreamEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.id >= start && e.id <= end)
            .cloned()
            .collect()
    }

    /// Trims the stream to at most `max_len` newest entries.
    pub async fn xtrim(&self, max_len: usize) {
        let mut entries = self.entries.write().await;
        while entries.len() > max_len {
            entries.pop_front();
        }
    }

    /// Most recent observation matching `aircraft_id`, regardless of
    /// consumer-group cursor position.
    pub async fn latest_for_aircraft(&self, aircraft_id: &str) -> Option<TelemetryObservation> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .find(|e| e.observation.aircraft_id == aircraft_id)
            .map(|e| e.observation.clone())
    }

    /// Entries appended since `group`'s last read, advancing its cursor.
    /// Each entry is yielded exactly once per group.
    pub async fn read_new(&self, group: &str) -> Vec<StreamEntry> {
        let cursor = self.group_cursors.get(group).map(|c| *c).unwrap_or(0);
        let entries = self.entries.read().await;
        let fresh: Vec<StreamEntry> = entries.iter().filter(|e| e.id > cursor).cloned().collect();
        if let Some(last) = fresh.last() {
            self.group_cursors.insert(group.to_string(), last.id);
        }
        fresh
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn observation(aircraft_id: &str) -> TelemetryObservation {
        TelemetryObservation {
            aircraft_id: aircraft_id.to_string(),
            lat: 46.98,
            lng: 7.48,
            alt_m: 95.0,
            timestamp: Utc::now(),
            operational_status: "Airborne".into(),
            track_deg: None,
            speed_mps: None,
            vertical_speed_mps: None,
            accuracy_m: None,
            height_agl_m: None,
            operator_details: None,
        }
    }

    #[tokio::test]
    async fn xadd_then_xrange_returns_appended_record() {
        let stream = ObservationStream::new(100);
        let id = stream.xadd(observation("uas-1")).await;
        let entries = stream.xrange(id, id).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].observation.aircraft_id, "uas-1");
    }

    #[tokio::test]
    async fn consumer_group_sees_each_entry_once() {
        let stream = ObservationStream::new(100);
        stream.xadd(observation("uas-1")).await;
        stream.xadd(observation("uas-2")).await;

        let first_read = stream.read_new("worker-a").await;
        assert_eq!(first_read.len(), 2);

        let second_read = stream.read_new("worker-a").await;
        assert!(second_read.is_empty());

        stream.xadd(observation("uas-3")).await;
        let third_read = stream.read_new("worker-a").await;
        assert_eq!(third_read.len(), 1);
    }

    #[tokio::test]
    async fn independent_groups_have_independent_cursors() {
        let stream = ObservationStream::new(100);
        stream.xadd(observation("uas-1")).await;

        let _ = stream.read_new("worker-a").await;
        let worker_b_read = stream.read_new("worker-b").await;
        assert_eq!(worker_b_read.len(), 1);
    }

    #[tokio::test]
    async fn bounded_by_max_entries() {
        let stream = ObservationStream::new(2);
        stream.xadd(observation("uas-1")).await;
        stream.xadd(observation("uas-2")).await;
        stream.xadd(observation("uas-3")).await;
        assert_eq!(stream.len().await, 2);
    }
}
