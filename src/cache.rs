//! TTL cache of last-known snapshots, keyed by channel id.
//!
//! Expiry is lazy: an entry at or past its deadline reads as absent even if it
//! still occupies the map. There is no background sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::model::ChannelId;

/// Time source for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Tokio's clock, so paused test runtimes control it too.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub items: Vec<T>,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct CacheStore<T> {
    entries: Arc<Mutex<HashMap<ChannelId, CacheEntry<T>>>>,
    clock: Arc<dyn Clock>,
}

impl<T> Clone for CacheStore<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T: Clone> Default for CacheStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> CacheStore<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, CacheEntry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ChannelId) -> Option<Vec<T>> {
        let now = self.clock.now();
        self.lock()
            .get(key)
            .filter(|entry| entry.is_valid_at(now))
            .map(|entry| entry.items.clone())
    }

    pub fn set(&self, key: &ChannelId, items: Vec<T>, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.lock()
            .insert(key.clone(), CacheEntry { items, expires_at });
    }

    pub fn remove(&self, key: &ChannelId) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Number of occupied slots, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
