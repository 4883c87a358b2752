use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, Url};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    pub max_connections_per_origin: usize,
    pub max_total_connections: usize,
    pub max_idle_per_origin: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Longest a request waits for a free connection slot before failing.
    pub acquire_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_origin: 32,
            max_total_connections: 256,
            max_idle_per_origin: 8,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(5),
            tcp_keepalive: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),
    #[error("no free connection to {origin} within {waited:?}")]
    Exhausted { origin: String, waited: Duration },
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl PoolError {
    pub fn is_timeout(&self) -> bool {
        match self {
            PoolError::Timeout(_) => true,
            PoolError::Request(err) => err.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn post_json(body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self {
            method: Method::POST,
            headers,
            body: Some(body.into()),
            timeout: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name, value.clone());
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Default)]
struct OriginCounters {
    active: AtomicUsize,
    idle: AtomicUsize,
    pending: AtomicUsize,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    average_latency_ms: Mutex<Option<f64>>,
}

impl OriginCounters {
    fn observe_latency(&self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        let mut avg = self
            .average_latency_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *avg = Some(match *avg {
            Some(current) => current + 0.2 * (sample - current),
            None => sample,
        });
    }

    fn take_idle(&self) {
        let _ = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| idle.checked_sub(1));
    }

    fn return_idle(&self, max_idle: usize) {
        let _ = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| {
                (idle < max_idle).then_some(idle + 1)
            });
    }
}

#[derive(Debug)]
struct OriginState {
    origin: String,
    slots: Arc<Semaphore>,
    counters: OriginCounters,
}

/// Holds one connection slot for an origin until dropped.
#[derive(Debug)]
pub struct ConnectionPermit {
    _global: OwnedSemaphorePermit,
    _origin: OwnedSemaphorePermit,
    state: Arc<OriginState>,
    max_idle: usize,
    reusable: bool,
}

impl ConnectionPermit {
    fn poison(&mut self) {
        self.reusable = false;
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.state.counters.active.fetch_sub(1, Ordering::AcqRel);
        if self.reusable {
            self.state.counters.return_idle(self.max_idle);
        }
    }
}

/// Fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct PooledResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub latency: Duration,
}

/// Upstream response whose headers have arrived; the body is still on the wire.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Time until response headers were received.
    pub latency: Duration,
    started: Instant,
    response: reqwest::Response,
    permit: ConnectionPermit,
}

impl UpstreamResponse {
    pub async fn bytes(self) -> Result<PooledResponse, PoolError> {
        let UpstreamResponse {
            status,
            headers,
            started,
            response,
            mut permit,
            ..
        } = self;
        match response.bytes().await {
            Ok(body) => Ok(PooledResponse {
                status,
                headers,
                body,
                latency: started.elapsed(),
            }),
            Err(err) => {
                permit.poison();
                permit.state.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::Request(err))
            }
        }
    }

    /// Body as a byte stream; the connection slot is released when the stream is dropped.
    pub fn into_byte_stream(self) -> BoxStream<'static, Result<Bytes, reqwest::Error>> {
        let permit = self.permit;
        self.response
            .bytes_stream()
            .map(move |item| {
                let _slot = &permit;
                item
            })
            .boxed()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginStats {
    pub origin: String,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub pending_requests: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub average_response_time: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub origins: usize,
    pub max_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub pending_requests: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub average_response_time: f64,
}

/// Upstream connections keyed by origin, with per-origin and global caps.
///
/// Socket reuse itself is delegated to the reqwest connection pool; this type
/// bounds how many connections may be in use at once and keeps the bookkeeping
/// used for reporting and warmup decisions.
#[derive(Debug)]
pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    client: RwLock<Option<Client>>,
    global_slots: Arc<Semaphore>,
    origins: Mutex<HashMap<String, Arc<OriginState>>>,
    closed: AtomicBool,
}

pub fn origin_of(url: &str) -> Result<String, PoolError> {
    let parsed = Url::parse(url).map_err(|_| PoolError::InvalidUrl(url.to_string()))?;
    if !parsed.has_host() {
        return Err(PoolError::InvalidUrl(url.to_string()));
    }
    Ok(parsed.origin().ascii_serialization())
}

impl ConnectionPool {
    pub fn new(config: ConnectionPoolConfig) -> Result<Self, PoolError> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_origin)
            .pool_idle_timeout(config.idle_timeout)
            .connect_timeout(config.connect_timeout);
        if let Some(keepalive) = config.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }
        let client = builder.build()?;

        tracing::debug!(
            max_total = config.max_total_connections,
            max_per_origin = config.max_connections_per_origin,
            "connection pool initialized"
        );

        Ok(Self {
            global_slots: Arc::new(Semaphore::new(config.max_total_connections.max(1))),
            config,
            client: RwLock::new(Some(client)),
            origins: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn client(&self) -> Result<Client, PoolError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PoolError::Closed)
    }

    fn origin_state(&self, origin: &str) -> Arc<OriginState> {
        let mut origins = self.origins.lock().unwrap_or_else(PoisonError::into_inner);
        origins
            .entry(origin.to_string())
            .or_insert_with(|| {
                Arc::new(OriginState {
                    origin: origin.to_string(),
                    slots: Arc::new(Semaphore::new(
                        self.config.max_connections_per_origin.max(1),
                    )),
                    counters: OriginCounters::default(),
                })
            })
            .clone()
    }

    async fn acquire(&self, state: Arc<OriginState>) -> Result<ConnectionPermit, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        state.counters.pending.fetch_add(1, Ordering::AcqRel);
        let waited = self.config.acquire_timeout;
        let acquired = tokio::time::timeout(waited, async {
            let global = self.global_slots.clone().acquire_owned().await?;
            let origin = state.slots.clone().acquire_owned().await?;
            Ok::<_, tokio::sync::AcquireError>((global, origin))
        })
        .await;
        state.counters.pending.fetch_sub(1, Ordering::AcqRel);

        let (global, origin) = match acquired {
            Ok(Ok(permits)) => permits,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                state.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Exhausted {
                    origin: state.origin.clone(),
                    waited,
                });
            }
        };

        state.counters.active.fetch_add(1, Ordering::AcqRel);
        state.counters.take_idle();
        Ok(ConnectionPermit {
            _global: global,
            _origin: origin,
            state,
            max_idle: self.config.max_idle_per_origin,
            reusable: true,
        })
    }

    /// Sends a request and returns as soon as response headers arrive.
    pub async fn send(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<UpstreamResponse, PoolError> {
        let origin = origin_of(url)?;
        let client = self.client()?;
        let state = self.origin_state(&origin);
        let mut permit = self.acquire(state.clone()).await?;

        state.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut request = client.request(options.method, url).headers(options.headers);
        if let Some(body) = options.body {
            request = request.body(body);
        }

        let started = Instant::now();
        let sent = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, request.send()).await {
                Ok(result) => result.map_err(PoolError::from),
                Err(_) => Err(PoolError::Timeout(timeout)),
            },
            None => request.send().await.map_err(PoolError::from),
        };

        match sent {
            Ok(response) => {
                let latency = started.elapsed();
                state.counters.observe_latency(latency);
                Ok(UpstreamResponse {
                    status: response.status(),
                    headers: response.headers().clone(),
                    latency,
                    started,
                    response,
                    permit,
                })
            }
            Err(err) => {
                permit.poison();
                state.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Sends a request and buffers the whole response body.
    pub async fn request(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<PooledResponse, PoolError> {
        self.send(url, options).await?.bytes().await
    }

    /// Best-effort pre-opening of idle connections; returns how many were opened.
    pub async fn warmup_connections(&self, origin: &str, count: usize) -> usize {
        let Ok(client) = self.client() else {
            return 0;
        };
        let state = self.origin_state(origin);
        let idle = state.counters.idle.load(Ordering::Acquire);
        let wanted = count
            .min(self.config.max_idle_per_origin)
            .saturating_sub(idle);
        if wanted == 0 {
            return 0;
        }

        let attempts = (0..wanted).map(|_| {
            let client = client.clone();
            let state = state.clone();
            async move {
                let mut permit = self.acquire(state.clone()).await.ok()?;
                let result = client
                    .head(state.origin.as_str())
                    .timeout(self.config.connect_timeout)
                    .send()
                    .await;
                if result.is_err() {
                    permit.poison();
                }
                drop(permit);
                match result {
                    Ok(_) => Some(()),
                    Err(err) => {
                        tracing::debug!(origin = %state.origin, error = %err, "connection warmup failed");
                        None
                    }
                }
            }
        });

        let warmed = futures_util::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .count();
        if warmed > 0 {
            tracing::debug!(origin = %origin, warmed, "warmed upstream connections");
        }
        warmed
    }

    /// Rejects new requests and drops idle connections.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.global_slots.close();
        let origins = self.origins.lock().unwrap_or_else(PoisonError::into_inner);
        for state in origins.values() {
            state.slots.close();
            state.counters.idle.store(0, Ordering::Release);
        }
        drop(origins);
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn origin_snapshot(state: &OriginState) -> OriginStats {
        let counters = &state.counters;
        OriginStats {
            origin: state.origin.clone(),
            active_connections: counters.active.load(Ordering::Acquire),
            idle_connections: counters.idle.load(Ordering::Acquire),
            pending_requests: counters.pending.load(Ordering::Acquire),
            total_requests: counters.total_requests.load(Ordering::Relaxed),
            total_errors: counters.total_errors.load(Ordering::Relaxed),
            average_response_time: counters
                .average_latency_ms
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .unwrap_or(0.0),
        }
    }

    pub fn get_stats(&self, origin: &str) -> Option<OriginStats> {
        let origins = self.origins.lock().unwrap_or_else(PoisonError::into_inner);
        origins.get(origin).map(|state| Self::origin_snapshot(state))
    }

    pub fn get_all_stats(&self) -> Vec<OriginStats> {
        let origins = self.origins.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<OriginStats> = origins
            .values()
            .map(|state| Self::origin_snapshot(state))
            .collect();
        all.sort_by(|a, b| a.origin.cmp(&b.origin));
        all
    }

    pub fn get_overall_stats(&self) -> PoolStats {
        let per_origin = self.get_all_stats();
        let mut overall = PoolStats {
            origins: per_origin.len(),
            max_connections: self.config.max_total_connections,
            ..PoolStats::default()
        };

        let mut weighted_latency = 0.0;
        for stats in &per_origin {
            overall.active_connections += stats.active_connections;
            overall.idle_connections += stats.idle_connections;
            overall.pending_requests += stats.pending_requests;
            overall.total_requests += stats.total_requests;
            overall.total_errors += stats.total_errors;
            weighted_latency += stats.average_response_time * stats.total_requests as f64;
        }
        if overall.total_requests > 0 {
            overall.average_response_time = weighted_latency / overall.total_requests as f64;
        }
        overall
    }

    pub fn log_stats(&self) {
        let stats = self.get_overall_stats();
        if stats.total_requests == 0 {
            return;
        }
        tracing::info!(
            origins = stats.origins,
            active = stats.active_connections,
            idle = stats.idle_connections,
            pending = stats.pending_requests,
            total_requests = stats.total_requests,
            total_errors = stats.total_errors,
            avg_response_ms = stats.average_response_time,
            "connection pool stats"
        );
    }
}
