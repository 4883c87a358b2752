use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::request::{EndpointConfig, RequestFormat};

#[derive(Debug, Clone)]
pub struct EndpointCacheConfig {
    /// Failure points at which an entry stops being served.
    pub failure_threshold: u32,
    pub health_check_interval: Duration,
    pub max_entries: usize,
}

impl Default for EndpointCacheConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            health_check_interval: Duration::from_secs(300),
            max_entries: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The endpoint does not exist for this upstream (HTTP 404).
    NotFound,
    /// Network error, timeout or any other non-success status.
    Error,
}

impl FailureKind {
    fn weight(self) -> u32 {
        match self {
            FailureKind::NotFound => 1,
            FailureKind::Error => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub base_url: String,
    pub model: String,
}

impl EndpointKey {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointCacheEntry {
    pub endpoint: EndpointConfig,
    pub average_latency_ms: f64,
    pub consecutive_failures: u32,
    failure_points: u32,
    pub last_verified: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub recorded_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCacheEntryView {
    pub base_url: String,
    pub model: String,
    pub path: String,
    pub format: RequestFormat,
    pub average_latency_ms: f64,
    pub consecutive_failures: u32,
    pub verified_ago_ms: u64,
}

/// Health probe for one cached endpoint; resolves to the observed latency.
pub type EndpointProbe = Arc<
    dyn Fn(EndpointKey, EndpointConfig) -> BoxFuture<'static, Result<Duration, FailureKind>>
        + Send
        + Sync,
>;

/// Which candidate endpoint last worked per (base URL, model).
#[derive(Debug, Default)]
pub struct EndpointCache {
    config: EndpointCacheConfig,
    entries: RwLock<HashMap<EndpointKey, EndpointCacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    recorded_failures: AtomicU64,
}

impl EndpointCache {
    pub fn new(config: EndpointCacheConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub async fn get_best_endpoint(&self, base_url: &str, model: &str) -> Option<EndpointConfig> {
        let key = EndpointKey::new(base_url, model);
        let entries = self.entries.read().await;
        match entries.get(&key) {
            Some(entry) if entry.failure_points < self.config.failure_threshold => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.endpoint.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn cache_successful_endpoint(
        &self,
        base_url: &str,
        model: &str,
        endpoint: &EndpointConfig,
        latency: Duration,
    ) {
        let key = EndpointKey::new(base_url, model);
        let sample = latency.as_secs_f64() * 1000.0;
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(&key) {
            if entry.endpoint == *endpoint {
                entry.average_latency_ms += 0.2 * (sample - entry.average_latency_ms);
                entry.consecutive_failures = 0;
                entry.failure_points = 0;
                entry.last_verified = Instant::now();
                return;
            }
        }

        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries.max(1) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_verified)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        tracing::debug!(
            base_url = %key.base_url,
            model = %key.model,
            endpoint = %endpoint,
            latency_ms = sample,
            "cached working endpoint"
        );
        entries.insert(
            key,
            EndpointCacheEntry {
                endpoint: endpoint.clone(),
                average_latency_ms: sample,
                consecutive_failures: 0,
                failure_points: 0,
                last_verified: Instant::now(),
            },
        );
    }

    /// Penalizes the cached entry when `endpoint` is the one it points at.
    pub async fn record_endpoint_failure(
        &self,
        base_url: &str,
        model: &str,
        endpoint: &EndpointConfig,
        kind: FailureKind,
    ) {
        self.recorded_failures.fetch_add(1, Ordering::Relaxed);

        let key = EndpointKey::new(base_url, model);
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&key) else {
            return;
        };
        if entry.endpoint != *endpoint {
            return;
        }

        entry.consecutive_failures += 1;
        entry.failure_points += kind.weight();
        if entry.failure_points >= self.config.failure_threshold {
            tracing::warn!(
                base_url = %key.base_url,
                model = %key.model,
                endpoint = %endpoint,
                consecutive_failures = entry.consecutive_failures,
                "evicting failing endpoint from cache"
            );
            entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn invalidate(&self, base_url: &str, model: &str) -> bool {
        let key = EndpointKey::new(base_url, model);
        self.entries.write().await.remove(&key).is_some()
    }

    async fn stale_entries(&self) -> Vec<(EndpointKey, EndpointConfig)> {
        let interval = self.config.health_check_interval;
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.last_verified.elapsed() >= interval)
            .map(|(key, entry)| (key.clone(), entry.endpoint.clone()))
            .collect()
    }

    /// Re-validates every stale entry once; returns how many were probed.
    pub async fn run_health_checks(&self, probe: &EndpointProbe) -> usize {
        let stale = self.stale_entries().await;
        let checked = stale.len();

        for (key, endpoint) in stale {
            match probe(key.clone(), endpoint.clone()).await {
                Ok(latency) => {
                    self.cache_successful_endpoint(&key.base_url, &key.model, &endpoint, latency)
                        .await;
                }
                Err(kind) => {
                    tracing::info!(
                        base_url = %key.base_url,
                        model = %key.model,
                        endpoint = %endpoint,
                        ?kind,
                        "endpoint health check failed"
                    );
                    self.record_endpoint_failure(&key.base_url, &key.model, &endpoint, kind)
                        .await;
                }
            }
        }
        checked
    }

    pub fn start_periodic_health_checks(self: Arc<Self>, probe: EndpointProbe) -> JoinHandle<()> {
        let period = self.config.health_check_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let checked = self.run_health_checks(&probe).await;
                if checked > 0 {
                    tracing::debug!(checked, "endpoint health checks complete");
                }
            }
        })
    }

    pub async fn stats(&self) -> EndpointCacheStats {
        EndpointCacheStats {
            entries: self.entries.read().await.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            recorded_failures: self.recorded_failures.load(Ordering::Relaxed),
        }
    }

    pub async fn snapshot(&self) -> Vec<EndpointCacheEntryView> {
        let entries = self.entries.read().await;
        let mut out: Vec<EndpointCacheEntryView> = entries
            .iter()
            .map(|(key, entry)| EndpointCacheEntryView {
                base_url: key.base_url.clone(),
                model: key.model.clone(),
                path: entry.endpoint.path.clone(),
                format: entry.endpoint.format,
                average_latency_ms: entry.average_latency_ms,
                consecutive_failures: entry.consecutive_failures,
                verified_ago_ms: entry.last_verified.elapsed().as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| (&a.base_url, &a.model).cmp(&(&b.base_url, &b.model)));
        out
    }
}
