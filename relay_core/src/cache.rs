//! Short-lived result caching used to bound store query rates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// One cached accessor result with its own fetch timestamp.
///
/// A hit requires the same key (e.g. the same row limit) and an entry younger
/// than the TTL. Failed fetches leave the previous entry untouched.
#[derive(Debug)]
pub struct CacheSlot<K, T> {
    entry: Option<CacheEntry<K, T>>,
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
struct CacheEntry<K, T> {
    fetched_at: Instant,
    key: K,
    value: T,
}

impl<K, T> Default for CacheSlot<K, T> {
    fn default() -> Self {
        Self {
            entry: None,
            hits: 0,
            misses: 0,
        }
    }
}

impl<K: PartialEq, T: Clone> CacheSlot<K, T> {
    pub fn get_or_fetch<E, F>(
        &mut self,
        now: Instant,
        ttl: Duration,
        key: K,
        fetch: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.fresh(now, ttl, &key) {
            self.hits += 1;
            return Ok(value);
        }
        self.misses += 1;
        let value = fetch()?;
        self.entry = Some(CacheEntry {
            fetched_at: now,
            key,
            value: value.clone(),
        });
        Ok(value)
    }

    pub fn fresh(&self, now: Instant, ttl: Duration, key: &K) -> Option<T> {
        self.entry
            .as_ref()
            .filter(|entry| entry.key == *key)
            .filter(|entry| now.saturating_duration_since(entry.fetched_at) < ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn last_value(&self) -> Option<&T> {
        self.entry.as_ref().map(|entry| &entry.value)
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
