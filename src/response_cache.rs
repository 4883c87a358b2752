use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::StatusCode;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};

use crate::request::Fingerprint;

#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub max_entries: usize,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            max_entries: 1_000,
        }
    }
}

/// A transformed, client-ready response body.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

#[derive(Debug)]
struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub in_flight: usize,
    pub deduplicated: u64,
}

/// Completed non-streaming responses keyed by request fingerprint.
#[derive(Debug, Default)]
pub struct ResponseCache {
    config: ResponseCacheConfig,
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.ttl
    }

    pub fn get_cached_response(&self, key: &Fingerprint) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a successful response; non-2xx responses are never cached.
    pub fn cache_response(&self, key: Fingerprint, response: CachedResponse, ttl: Duration) -> bool {
        if !response.status.is_success() || ttl.is_zero() || self.config.max_entries == 0 {
            return false;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        self.expired
            .fetch_add((before - entries.len()) as u64, Ordering::Relaxed);

        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                response,
                expires_at: now + ttl,
            },
        );
        true
    }

    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn start_periodic_sweep(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.sweep_interval.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired cached responses");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ResponseCacheStats {
        ResponseCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ..ResponseCacheStats::default()
        }
    }
}

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Coalesces identical concurrent requests onto a single producer run.
pub struct RequestDeduplicator<T, E> {
    in_flight: Arc<Mutex<HashMap<Fingerprint, SharedResult<T, E>>>>,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<T, E> Default for RequestDeduplicator<T, E> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }
}

impl<T, E> RequestDeduplicator<T, E> {
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

impl<T, E> std::fmt::Debug for RequestDeduplicator<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("in_flight", &self.in_flight_count())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("joined", &self.joined.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T, E> RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<JoinError> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight request for `key`, or runs `producer` as the one that others join.
    ///
    /// The producer runs on its own task, so it finishes (and clears its
    /// in-flight slot) even if every waiter goes away.
    pub async fn deduplicate_request<F, Fut>(&self, key: Fingerprint, producer: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = in_flight.get(&key) {
                self.joined.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = %key, "joined in-flight request");
                existing.clone()
            } else {
                self.started.fetch_add(1, Ordering::Relaxed);
                let work = producer();
                let registry = self.in_flight.clone();
                let slot = key.clone();
                let task = tokio::spawn(async move {
                    let result = work.await;
                    registry
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&slot);
                    result
                });
                let shared = async move { task.await.unwrap_or_else(|err| Err(E::from(err))) }
                    .boxed()
                    .shared();
                in_flight.insert(key, shared.clone());
                shared
            }
        };
        shared.await
    }
}
