//! In-memory response cache for GET requests.

use crate::config::{CacheConfig, EvictionStrategy};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Cache key: method, URL and serialized query, compared verbatim.
///
/// Query pairs are not reordered, so `?a=1&b=2` and `?b=2&a=1` are
/// different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: HttpMethod,
    url: String,
    params: String,
}

impl CacheKey {
    /// Creates a key.
    pub fn new(method: HttpMethod, url: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: params.into(),
        }
    }

    /// Key for a request.
    pub fn from_request(request: &HttpRequest) -> Self {
        Self::new(request.method, request.url.clone(), request.serialized_query())
    }
}

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Response snapshot.
    pub response: HttpResponse,
    /// Absolute expiry; `None` when the TTL runs past the clock's range.
    pub expires_at: Option<Instant>,
    inserted: u64,
    last_access: u64,
}

impl CacheEntry {
    /// An entry is expired at and after its expiry instant.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    sequence: u64,
}

impl CacheState {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before - self.entries.len()
    }

    fn evict_one(&mut self, strategy: EvictionStrategy) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| match strategy {
                EvictionStrategy::Fifo => entry.inserted,
                EvictionStrategy::Lru => entry.last_access,
            })
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }
}

/// TTL- and capacity-bound response cache.
#[derive(Debug)]
pub struct ResponseCache {
    state: Mutex<CacheState>,
    max_size: usize,
    strategy: EvictionStrategy,
}

impl ResponseCache {
    /// Creates a cache holding at most `max_size` entries.
    pub fn new(max_size: usize, strategy: EvictionStrategy) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_size,
            strategy,
        }
    }

    /// Creates a cache from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, config.strategy)
    }

    /// Returns a live entry's response. Expired entries are dropped on read.
    pub fn get(&self, key: &CacheKey) -> Option<HttpResponse> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.entries.get(key)?.is_expired_at(now) {
            state.entries.remove(key);
            return None;
        }

        let access = state.next_sequence();
        let entry = state.entries.get_mut(key)?;
        entry.last_access = access;
        Some(entry.response.clone())
    }

    /// Stores a response for `ttl`.
    ///
    /// Expired entries are purged first; if the cache is still over capacity
    /// entries are evicted per the configured strategy.
    pub fn put(&self, key: CacheKey, response: HttpResponse, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.state.lock();

        state.purge_expired(now);

        let sequence = state.next_sequence();
        state.entries.insert(
            key,
            CacheEntry {
                response,
                expires_at: now.checked_add(ttl),
                inserted: sequence,
                last_access: sequence,
            },
        );

        while state.entries.len() > self.max_size {
            if !state.evict_one(self.strategy) {
                break;
            }
        }
    }

    /// Drops expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.state.lock().purge_expired(Instant::now())
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
