//! KV store (component A): `get/set/delete`, atomic `set_if_absent`, TTL
//! expiry, and bounded prefix scan. Grounded in `AppState`'s DashMap fields
//! and `cache::prune_cache`'s generic TTL-sweep pattern, generalized from
//! several typed maps to one generic string-keyed store holding
//! operational-intent snapshots, the DSS token cache, and cross-indexes.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Transient failures are worth a caller-side retry with backoff (see
/// `crate::backoff::Backoff`); permanent failures are not.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

struct Entry {
    value: serde_json::Value,
    stored_at: Instant,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

/// Generic string-keyed KV store with per-key TTL. One instance is wired at
/// process start-up and shared across every component per §9's "explicit
/// store interfaces" design note.
#[derive(Default)]
pub struct KvStore {
    map: DashMap<String, Entry>,
}

impl KvStore {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Option<Duration>) -> Result<(), StoreError> {
        let json = serde_json::to_value(value).map_err(|e| StoreError::Permanent(e.to_string()))?;
        self.map.insert(
            key.into(),
            Entry {
                value: json,
                stored_at: Instant::now(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(entry) = self.map.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.map.remove(key);
            return Ok(None);
        }
        serde_json::from_value(entry.value.clone())
            .map(Some)
            .map_err(|e| StoreError::Permanent(e.to_string()))
    }

    pub fn delete(&self, key: &str) {
        self.map.remove(key);
    }

    /// Atomic insert-if-absent. Returns `true` if the value was stored,
    /// `false` if an unexpired entry already existed.
    pub fn set_if_absent<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Option<Duration>) -> Result<bool, StoreError> {
        let key = key.into();
        let json = serde_json::to_value(value).map_err(|e| StoreError::Permanent(e.to_string()))?;

        let mut inserted = false;
        self.map
            .entry(key)
            .and_modify(|existing| {
                if existing.is_expired() {
                    existing.value = json.clone();
                    existing.stored_at = Instant::now();
                    existing.expires_at = ttl.map(|d| Instant::now() + d);
                    inserted = true;
                }
            })
            .or_insert_with(|| {
                inserted = true;
                Entry {
                    value: json,
                    stored_at: Instant::now(),
                    expires_at: ttl.map(|d| Instant::now() + d),
                }
            });

        Ok(inserted)
    }

    /// Bounded-batch scan of keys sharing `prefix`.
    pub fn scan(&self, prefix: &str, limit: usize) -> Vec<String> {
        self.map
            .iter()
            .filter(|entry| !entry.is_expired() && entry.key().starts_with(prefix))
            .take(limit)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Periodic sweep dropping expired entries; call from a background tick
    /// rather than on every read so lazy expiry (in `get`) stays cheap.
    pub fn sweep_expired(&self) {
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|entry| entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            self.map.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[cfg(test)]
    fn oldest_stored_at(&self, key: &str) -> Option<Instant> {
        self.map.get(key).map(|e| e.stored_at)
    }
}
