//! Process-local counter storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::error::StorageError;
use crate::ratelimit::{
    Clock, Fingerprint, ManuallyResettable, RateLimit, RateLimitStorage, StorageResult,
    StoredRateLimit, SystemClock,
};

/// In-memory storage backed by a `DashMap`.
///
/// Create one per process and share it through an `Arc`. Every operation
/// holds the shard lock for its key, so `store` never overwrites a
/// concurrent creation, `reset` never removes a window that is still live
/// and `increment_hits` always counts on top of the latest record. Every
/// hit counted in a live window is kept. A hit whose increment lands after
/// its window expired and was reset is dropped along with that window.
///
/// Keys never expire on their own. The limiter evicts an outdated window
/// when its fingerprint is requested again; windows of fingerprints that
/// are never seen again stay until [`InMemoryStorage::purge_outdated`] runs,
/// so long-lived hosts should call it periodically or use
/// [`InMemoryStorage::spawn_purge`].
#[derive(Debug)]
pub struct InMemoryStorage {
    records: DashMap<Fingerprint, StoredRateLimit>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStorage {
    /// Create an empty storage using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty storage using the given clock for window creation.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Number of stored windows, outdated ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every stored window.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Remove every outdated window. Returns the number removed.
    pub fn purge_outdated(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, stored| !stored.is_outdated(now));
        before.saturating_sub(self.records.len())
    }

    /// Purge outdated windows every `every` on the current tokio runtime.
    /// Abort the returned handle to stop.
    pub fn spawn_purge(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let purged = storage.purge_outdated();
                if purged > 0 {
                    debug!(purged, remaining = storage.len(), "Purged outdated windows");
                }
            }
        })
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStorage for InMemoryStorage {
    async fn get_stored(&self, rate_limit: &RateLimit) -> StorageResult<Option<StoredRateLimit>> {
        let fingerprint = rate_limit.hash()?;
        Ok(self.records.get(&fingerprint).map(|r| r.value().clone()))
    }

    async fn store(&self, rate_limit: &RateLimit) -> StorageResult<StoredRateLimit> {
        let stored = StoredRateLimit::open_window(rate_limit, self.clock.now())?;

        match self.records.entry(stored.fingerprint()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists(stored.fingerprint().to_hex())),
            Entry::Vacant(entry) => {
                trace!(fingerprint = %stored.fingerprint(), "Stored new window");
                entry.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn increment_hits(&self, stored: &StoredRateLimit) -> StorageResult<StoredRateLimit> {
        let next = match self.records.entry(stored.fingerprint()) {
            Entry::Occupied(mut entry) => {
                let next = entry.get().with_hits(entry.get().hits() + 1);
                entry.insert(next.clone());
                next
            }
            Entry::Vacant(entry) => {
                // Removed since our read. An outdated window stays removed.
                let next = stored.with_hits(stored.hits() + 1);
                if !next.is_outdated(self.clock.now()) {
                    entry.insert(next.clone());
                }
                next
            }
        };

        Ok(next)
    }

    fn as_resettable(&self) -> Option<&dyn ManuallyResettable> {
        Some(self)
    }
}

#[async_trait]
impl ManuallyResettable for InMemoryStorage {
    async fn reset(&self, rate_limit: &RateLimit) -> StorageResult<()> {
        let fingerprint = rate_limit.hash()?;
        let now = self.clock.now();
        self.records.remove_if(&fingerprint, |_, stored| stored.is_outdated(now));
        Ok(())
    }
}
