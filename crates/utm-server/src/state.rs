//! Process-wide shared state: the KV store, the observation stream, the
//! relational database handle, the DSS client, and per-declaration locks —
//! one instance wired at start-up and shared (via `Arc`) across the API
//! layer, the orchestrator, and every background loop.
//!
//! Grounded in `atc-server::state::AppState` (the teacher's single shared
//! struct composing DashMaps, a database handle, and loop heartbeats).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use utm_dss::{DssClient, TokenCache};

use crate::config::Config;
use crate::locks::DeclarationLocks;
use crate::persistence::Database;
use crate::store::{KvStore, ObservationStream};

pub struct AppState {
    pub config: Config,
    database: Option<Database>,
    pub kv: KvStore,
    pub stream: ObservationStream,
    pub dss: DssClient,
    pub locks: DeclarationLocks,
    loop_heartbeats: DashMap<&'static str, AtomicU64>,
}

impl AppState {
    pub fn new(config: Config, database: Option<Database>) -> Self {
        let token_cache = Arc::new(TokenCache::new(config.dss_oauth_config()));
        let dss = DssClient::new(config.dss_base_url.clone(), config.dss_self_audience.clone(), token_cache);
        let watchdog = std::time::Duration::from_secs(config.lock_watchdog_secs);

        Self {
            config,
            database,
            kv: KvStore::new(),
            stream: ObservationStream::new(10_000),
            dss,
            locks: DeclarationLocks::new(watchdog),
            loop_heartbeats: DashMap::new(),
        }
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    pub fn mark_loop_heartbeat(&self, name: &'static str) {
        let now = now_secs();
        self.loop_heartbeats.entry(name).or_insert_with(|| AtomicU64::new(0)).store(now, Ordering::Relaxed);
    }

    pub fn loop_last_tick_secs(&self, name: &str) -> Option<u64> {
        self.loop_heartbeats.get(name).map(|entry| entry.load(Ordering::Relaxed))
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
