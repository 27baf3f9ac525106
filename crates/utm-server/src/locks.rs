//! Per-declaration advisory lock serializing state transitions and
//! conformance checks for one declaration at a time, with a watchdog so a
//! crashed worker never blocks the declaration forever.
//!
//! Grounded in `AppState::flight_plan_booking_lock` (a single global
//! `tokio::sync::Mutex<()>` used exactly to serialize a critical section),
//! generalized to per-declaration granularity via a `DashMap<Uuid,
//! Arc<Mutex<()>>>`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

const DEFAULT_WATCHDOG: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct DeclarationLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    watchdog: Duration,
}

impl Default for DeclarationLocks {
    fn default() -> Self {
        Self::new(DEFAULT_WATCHDOG)
    }
}

impl DeclarationLocks {
    pub fn new(watchdog: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            watchdog,
        }
    }

    fn lock_for(&self, declaration_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(declaration_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquires the advisory lock for `declaration_id`, waiting up to the
    /// configured watchdog duration. `None` means the watchdog elapsed
    /// without acquiring the lock — the caller should treat this as a
    /// transient failure and retry on its next tick, never as a reason to
    /// mutate state unguarded.
    pub async fn acquire(&self, declaration_id: Uuid) -> Option<OwnedMutexGuard<()>> {
        let lock = self.lock_for(declaration_id);
        tokio::time::timeout(self.watchdog, lock.lock_owned()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_when_uncontended() {
        let locks = DeclarationLocks::new(Duration::from_millis(50));
        let id = Uuid::new_v4();
        assert!(locks.acquire(id).await.is_some());
    }

    #[tokio::test]
    async fn second_acquire_waits_then_times_out_while_held() {
        let locks = DeclarationLocks::new(Duration::from_millis(20));
        let id = Uuid::new_v4();
        let guard = locks.acquire(id).await.unwrap();

        let blocked = locks.acquire(id).await;
        assert!(blocked.is_none());
        drop(guard);

        assert!(locks.acquire(id).await.is_some());
    }

    #[tokio::test]
    async fn distinct_declarations_do_not_contend() {
        let locks = DeclarationLocks::new(Duration::from_millis(50));
        let a = locks.acquire(Uuid::new_v4()).await;
        let b = locks.acquire(Uuid::new_v4()).await;
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
