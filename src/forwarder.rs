use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use futures_util::FutureExt;
use tokio::task::{JoinHandle, JoinSet};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::GatewayConfig;
use crate::credentials::{resolve_base_url, CredentialProvider};
use crate::endpoint_cache::{EndpointCache, EndpointKey, EndpointProbe, FailureKind};
use crate::error::ForwardError;
use crate::pool::{origin_of, ConnectionPool, PoolError, RequestOptions, UpstreamResponse};
use crate::request::{ChatRequest, EndpointConfig, ValidationError};
use crate::response::transform_completion;
use crate::response_cache::{CachedResponse, RequestDeduplicator, ResponseCache};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::streaming::{RelaySummary, StreamRelay, StreamSink, StreamTicket};

const EDITOR_VERSION: &str = "vscode/1.85.0";
const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.11.1";
const COPILOT_USER_AGENT: &str = "GitHubCopilotChat/0.11.1";
const COPILOT_INTEGRATION_ID: &str = "vscode-chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub cache: CacheStatus,
}

#[derive(Debug, Clone)]
struct UpstreamTarget {
    token: String,
    base_url: String,
}

/// A stream that has been admitted and whose upstream answered with headers.
#[derive(Debug)]
pub struct PreparedStream {
    ticket: StreamTicket,
    response: UpstreamResponse,
    model: String,
}

impl PreparedStream {
    pub fn id(&self) -> &str {
        self.ticket.id()
    }

    pub async fn relay<K>(self, sink: &mut K) -> RelaySummary
    where
        K: StreamSink + ?Sized,
    {
        let PreparedStream {
            ticket,
            response,
            model,
        } = self;
        ticket.relay(response.into_byte_stream(), &model, sink).await
    }
}

/// The forwarding pipeline: caching, deduplication, endpoint resolution and relay.
pub struct Forwarder {
    credentials: Arc<dyn CredentialProvider>,
    pool: Arc<ConnectionPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    endpoints: Arc<EndpointCache>,
    responses: Arc<ResponseCache>,
    dedup: RequestDeduplicator<CachedResponse, ForwardError>,
    streams: Arc<StreamRelay>,
    candidates: Vec<EndpointConfig>,
    retry: RetryConfig,
    request_timeout: Duration,
    warmup_connections: usize,
    metrics_log_interval: Duration,
}

fn failure_kind(err: &ForwardError) -> FailureKind {
    match err {
        ForwardError::UpstreamStatus { status: 404, .. } => FailureKind::NotFound,
        _ => FailureKind::Error,
    }
}

fn upstream_headers(token: &str, stream: bool) -> Result<HeaderMap, ForwardError> {
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| ForwardError::Authentication)?;

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(if stream {
            "text/event-stream"
        } else {
            "application/json"
        }),
    );
    headers.insert(USER_AGENT, HeaderValue::from_static(COPILOT_USER_AGENT));
    headers.insert(
        HeaderName::from_static("editor-version"),
        HeaderValue::from_static(EDITOR_VERSION),
    );
    headers.insert(
        HeaderName::from_static("editor-plugin-version"),
        HeaderValue::from_static(EDITOR_PLUGIN_VERSION),
    );
    headers.insert(
        HeaderName::from_static("copilot-integration-id"),
        HeaderValue::from_static(COPILOT_INTEGRATION_ID),
    );
    Ok(headers)
}

impl Forwarder {
    pub fn new(
        config: &GatewayConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, PoolError> {
        Ok(Self {
            credentials,
            pool: Arc::new(ConnectionPool::new(config.pool.clone())?),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            endpoints: Arc::new(EndpointCache::new(config.endpoint_cache.clone())),
            responses: Arc::new(ResponseCache::new(config.response_cache.clone())),
            dedup: RequestDeduplicator::new(),
            streams: Arc::new(StreamRelay::new(config.streaming.clone())),
            candidates: config.candidates.clone(),
            retry: config.retry.clone(),
            request_timeout: config.upstream_request_timeout,
            warmup_connections: config.warmup_connections,
            metrics_log_interval: config.metrics_log_interval,
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn endpoints(&self) -> &Arc<EndpointCache> {
        &self.endpoints
    }

    pub fn responses(&self) -> &Arc<ResponseCache> {
        &self.responses
    }

    pub fn streams(&self) -> &Arc<StreamRelay> {
        &self.streams
    }

    pub fn deduplicator(&self) -> &RequestDeduplicator<CachedResponse, ForwardError> {
        &self.dedup
    }

    async fn target(&self) -> Result<UpstreamTarget, ForwardError> {
        let token = self
            .credentials
            .access_token()
            .await
            .ok_or(ForwardError::Authentication)?;
        let base_url = resolve_base_url(self.credentials.as_ref()).await;
        Ok(UpstreamTarget { token, base_url })
    }

    /// Non-streaming completion: served from cache, joined onto an identical
    /// in-flight request, or fetched upstream exactly once.
    pub async fn forward(self: &Arc<Self>, req: ChatRequest) -> Result<ForwardResponse, ForwardError> {
        if req.is_stream() {
            return Err(ValidationError {
                message: "streaming requests must use the streaming path".to_string(),
                param: Some("stream"),
            }
            .into());
        }
        let target = self.target().await?;

        let key = req.fingerprint();
        if let Some(hit) = self.responses.get_cached_response(&key) {
            tracing::debug!(fingerprint = %key, model = req.model(), "response cache hit");
            return Ok(ForwardResponse {
                status: hit.status,
                body: hit.body,
                cache: CacheStatus::Hit,
            });
        }

        let this = self.clone();
        let cache_key = key.clone();
        let fetched = self
            .dedup
            .deduplicate_request(key, move || async move {
                let response = this.fetch_completion(&target, &req).await?;
                this.responses
                    .cache_response(cache_key, response.clone(), this.responses.default_ttl());
                Ok(response)
            })
            .await?;

        Ok(ForwardResponse {
            status: fetched.status,
            body: fetched.body,
            cache: CacheStatus::Miss,
        })
    }

    async fn fetch_completion(
        self: &Arc<Self>,
        target: &UpstreamTarget,
        req: &ChatRequest,
    ) -> Result<CachedResponse, ForwardError> {
        let (endpoint, response) = self.resolve(target, req).await?;
        let url = endpoint.url(&target.base_url);

        let body = match tokio::time::timeout(self.request_timeout, response.bytes()).await {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => return Err(ForwardError::from_pool(&url, err)),
            Err(_) => {
                return Err(ForwardError::UpstreamTimeout {
                    endpoint: url,
                    timeout: self.request_timeout,
                })
            }
        };

        let completion = transform_completion(&body.body, req.model()).map_err(|err| {
            ForwardError::InvalidResponse {
                endpoint: url.clone(),
                message: err.to_string(),
            }
        })?;
        tracing::debug!(
            endpoint = %url,
            model = %completion.model,
            requested = req.model(),
            "upstream completion model"
        );
        let encoded = serde_json::to_vec(&completion)
            .map_err(|err| ForwardError::Internal(format!("failed to encode completion: {err}")))?;

        Ok(CachedResponse {
            status: StatusCode::OK,
            body: Bytes::from(encoded),
        })
    }

    /// Admits a streaming request and opens its upstream; errors here happen before
    /// any byte reaches the client.
    pub async fn open_stream(
        self: &Arc<Self>,
        req: ChatRequest,
        client_key: Option<&str>,
    ) -> Result<PreparedStream, ForwardError> {
        let target = self.target().await?;
        let ticket = self.streams.admit(client_key)?;
        let (_, response) = self.resolve(&target, &req).await?;

        tracing::debug!(stream_id = %ticket.id(), model = req.model(), "upstream stream opened");
        Ok(PreparedStream {
            ticket,
            response,
            model: req.model().to_string(),
        })
    }

    pub async fn forward_streaming<K>(
        self: &Arc<Self>,
        req: ChatRequest,
        client_key: Option<&str>,
        sink: &mut K,
    ) -> Result<RelaySummary, ForwardError>
    where
        K: StreamSink + ?Sized,
    {
        let prepared = self.open_stream(req, client_key).await?;
        Ok(prepared.relay(sink).await)
    }

    /// Finds a working endpoint for the request and returns its live response.
    async fn resolve(
        self: &Arc<Self>,
        target: &UpstreamTarget,
        req: &ChatRequest,
    ) -> Result<(EndpointConfig, UpstreamResponse), ForwardError> {
        let model = req.model();
        if let Some(endpoint) = self.endpoints.get_best_endpoint(&target.base_url, model).await {
            let result = retry_with_backoff(
                &self.retry,
                |_| self.attempt(target, req, &endpoint),
                ForwardError::is_retryable,
            )
            .await;

            match result {
                Ok(response) => {
                    self.endpoints
                        .cache_successful_endpoint(&target.base_url, model, &endpoint, response.latency)
                        .await;
                    self.spawn_warmup(&endpoint.url(&target.base_url));
                    return Ok((endpoint, response));
                }
                Err(err) => {
                    let kind = failure_kind(&err);
                    self.endpoints
                        .record_endpoint_failure(&target.base_url, model, &endpoint, kind)
                        .await;
                    if kind != FailureKind::NotFound {
                        return Err(err);
                    }
                    tracing::info!(
                        endpoint = %endpoint,
                        model,
                        "cached endpoint no longer exists, rediscovering"
                    );
                    self.endpoints.invalidate(&target.base_url, model).await;
                }
            }
        }

        let (endpoint, response) = self.discover(target, req).await?;
        self.spawn_warmup(&endpoint.url(&target.base_url));
        Ok((endpoint, response))
    }

    /// Races every candidate at once; the first success wins and the rest are cancelled.
    async fn discover(
        self: &Arc<Self>,
        target: &UpstreamTarget,
        req: &ChatRequest,
    ) -> Result<(EndpointConfig, UpstreamResponse), ForwardError> {
        let model = req.model();
        let total = self.candidates.len();
        let mut attempts = JoinSet::new();
        for endpoint in self.candidates.iter().cloned() {
            let this = self.clone();
            let target = target.clone();
            let req = req.clone();
            attempts.spawn(async move {
                let result = this.attempt(&target, &req, &endpoint).await;
                (endpoint, result)
            });
        }

        let mut last_error = None;
        let mut all_open = total > 0;
        while let Some(joined) = attempts.join_next().await {
            let (endpoint, result) = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    all_open = false;
                    last_error = Some(ForwardError::from(err));
                    continue;
                }
            };

            match result {
                Ok(response) => {
                    attempts.abort_all();
                    tracing::info!(
                        base_url = %target.base_url,
                        model,
                        endpoint = %endpoint,
                        latency_ms = response.latency.as_millis() as u64,
                        "discovered working endpoint"
                    );
                    self.endpoints
                        .cache_successful_endpoint(&target.base_url, model, &endpoint, response.latency)
                        .await;
                    return Ok((endpoint, response));
                }
                Err(err) => {
                    tracing::debug!(endpoint = %endpoint, error = %err, "discovery attempt failed");
                    if !matches!(err, ForwardError::CircuitOpen { .. }) {
                        all_open = false;
                    }
                    self.endpoints
                        .record_endpoint_failure(&target.base_url, model, &endpoint, failure_kind(&err))
                        .await;
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err @ ForwardError::CircuitOpen { .. }) if all_open => Err(err),
            Some(ForwardError::Authentication) => Err(ForwardError::Authentication),
            last => {
                let last = last.map(|err| err.to_string()).unwrap_or_default();
                tracing::warn!(attempts = total, model, last_error = %last, "endpoint discovery failed");
                Err(ForwardError::DiscoveryFailed {
                    attempts: total,
                    last,
                })
            }
        }
    }

    /// One breaker-guarded upstream call; succeeds only on a 2xx status.
    async fn attempt(
        &self,
        target: &UpstreamTarget,
        req: &ChatRequest,
        endpoint: &EndpointConfig,
    ) -> Result<UpstreamResponse, ForwardError> {
        let url = endpoint.url(&target.base_url);
        let body = req
            .upstream_body(endpoint.format)
            .map_err(|err| ForwardError::Internal(format!("failed to encode request: {err}")))?;
        let options = RequestOptions::post_json(body)
            .headers(&upstream_headers(&target.token, req.is_stream())?)
            .timeout(self.request_timeout);

        let breaker = self.breakers.get_or_create(&url);
        breaker
            .execute(|| async {
                let response = self
                    .pool
                    .send(&url, options)
                    .await
                    .map_err(|err| ForwardError::from_pool(&url, err))?;
                if !response.status.is_success() {
                    return Err(ForwardError::UpstreamStatus {
                        endpoint: url.clone(),
                        status: response.status.as_u16(),
                    });
                }
                Ok(response)
            })
            .await
            .map_err(|err| ForwardError::from_circuit(&url, err))
    }

    fn spawn_warmup(&self, url: &str) {
        let count = self.warmup_connections;
        if count == 0 {
            return;
        }
        let Ok(origin) = origin_of(url) else {
            return;
        };
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let warmed = pool.warmup_connections(&origin, count).await;
            if warmed > 0 {
                tracing::debug!(origin = %origin, warmed, "warmed connections after resolution");
            }
        });
    }

    /// Re-validates one cached endpoint with a minimal request.
    async fn probe_endpoint(
        &self,
        key: &EndpointKey,
        endpoint: &EndpointConfig,
    ) -> Result<Duration, FailureKind> {
        let Some(token) = self.credentials.access_token().await else {
            return Err(FailureKind::Error);
        };
        let target = UpstreamTarget {
            token,
            base_url: key.base_url.clone(),
        };
        match self
            .attempt(&target, &ChatRequest::probe(&key.model), endpoint)
            .await
        {
            Ok(response) => Ok(response.latency),
            Err(err) => Err(failure_kind(&err)),
        }
    }

    /// Background maintenance: endpoint health checks, cache and stuck-stream
    /// sweeps, and periodic stats logging.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let prober = self.clone();
        let probe: EndpointProbe = Arc::new(move |key: EndpointKey, endpoint: EndpointConfig| {
            let prober = prober.clone();
            async move { prober.probe_endpoint(&key, &endpoint).await }.boxed()
        });

        let reporter = self.clone();
        let period = self.metrics_log_interval.max(Duration::from_secs(1));
        let metrics = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reporter.pool.log_stats();
                reporter.breakers.log_health();
                reporter.streams.log_metrics();
            }
        });

        vec![
            self.endpoints.clone().start_periodic_health_checks(probe),
            self.responses.clone().start_periodic_sweep(),
            self.streams.clone().start_stuck_stream_sweep(),
            metrics,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use crate::credentials::StaticCredentials;
    use crate::request::RequestFormat;
    use crate::streaming::{BufferSink, StreamOutcome};
    use crate::test_support::spawn_upstream;
    use tracing_test::traced_test;

    fn test_config(base_url: &str) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.upstream_base_url = Some(base_url.to_string());
        config.access_token = Some("test-token".to_string());
        config.upstream_request_timeout = Duration::from_millis(500);
        config.warmup_connections = 0;
        config.retry.initial_backoff = Duration::from_millis(1);
        config.retry.max_backoff = Duration::from_millis(5);
        config
    }

    fn forwarder(config: &GatewayConfig) -> Arc<Forwarder> {
        let credentials = Arc::new(StaticCredentials::new(
            config.access_token.clone(),
            config.upstream_base_url.clone(),
        ));
        Arc::new(Forwarder::new(config, credentials).unwrap())
    }

    fn chat(stream: bool) -> ChatRequest {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": stream
        });
        ChatRequest::parse(&serde_json::to_vec(&body).unwrap()).unwrap()
    }

    #[derive(Clone, Default)]
    struct Hits(Arc<AtomicUsize>);

    async fn slow_completion(State(hits): State<Hits>) -> Json<Value> {
        let n = hits.0.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Json(json!({
            "id": format!("chatcmpl-{n}"),
            "model": "gpt-4",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}]
        }))
    }

    #[tokio::test]
    async fn identical_concurrent_requests_share_one_upstream_call() {
        let hits = Hits::default();
        let upstream = Router::new()
            .route("/chat/completions", post(slow_completion))
            .with_state(hits.clone());
        let (base_url, handle) = spawn_upstream(upstream).await;

        let mut config = test_config(&base_url);
        config.candidates = vec![EndpointConfig::new("/chat/completions", RequestFormat::Standard)];
        let forwarder = forwarder(&config);

        let (a, b) = tokio::join!(forwarder.forward(chat(false)), forwarder.forward(chat(false)));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(hits.0.load(Ordering::SeqCst), 1);

        let id = |body: &Bytes| serde_json::from_slice::<Value>(body).unwrap()["id"].clone();
        assert_eq!(id(&a.body), id(&b.body));
        assert_eq!(a.cache, CacheStatus::Miss);

        let cached = forwarder.forward(chat(false)).await.unwrap();
        assert_eq!(cached.cache, CacheStatus::Hit);
        assert_eq!(id(&cached.body), id(&a.body));
        assert_eq!(hits.0.load(Ordering::SeqCst), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn discovery_race_picks_working_candidate_and_caches_it() {
        let calls: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let record = |path: &'static str, calls: Arc<std::sync::Mutex<Vec<String>>>, ok: bool| {
            post(move |Json(body): Json<Value>| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(path.to_string());
                    if ok {
                        assert!(body.get("prompt").is_some());
                        Json(json!({"choices": [{"text": "legacy ok"}]})).into_response()
                    } else {
                        StatusCode::NOT_FOUND.into_response()
                    }
                }
            })
        };
        let upstream = Router::new()
            .route("/chat/completions", record("/chat/completions", calls.clone(), false))
            .route("/v1/chat/completions", record("/v1/chat/completions", calls.clone(), false))
            .route(
                "/v1/engines/copilot-codex/completions",
                record("/v1/engines/copilot-codex/completions", calls.clone(), true),
            );
        let (base_url, handle) = spawn_upstream(upstream).await;

        let forwarder = forwarder(&test_config(&base_url));
        let first = forwarder.forward(chat(false)).await.unwrap();
        let body: Value = serde_json::from_slice(&first.body).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "legacy ok");
        assert!(calls.lock().unwrap().len() <= 4);

        let cached = forwarder.endpoints().get_best_endpoint(&base_url, "gpt-4").await;
        assert_eq!(cached.map(|e| e.format), Some(RequestFormat::LegacyPrompt));

        tokio::time::sleep(Duration::from_millis(50)).await;
        calls.lock().unwrap().clear();
        let different = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "again"}]});
        let req = ChatRequest::parse(&serde_json::to_vec(&different).unwrap()).unwrap();
        forwarder.forward(req).await.unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["/v1/engines/copilot-codex/completions".to_string()]
        );

        handle.abort();
    }

    #[tokio::test]
    async fn discovery_race_cancels_slower_candidates_once_one_wins() {
        let calls: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::default();
        let slow_started = Arc::new(tokio::sync::Notify::new());
        let (guard, released) = tokio::sync::oneshot::channel::<()>();
        let guard = Arc::new(std::sync::Mutex::new(Some(guard)));

        let slow = {
            let calls = calls.clone();
            let slow_started = slow_started.clone();
            post(move || {
                let calls = calls.clone();
                let slow_started = slow_started.clone();
                let held = guard.lock().unwrap().take();
                async move {
                    let _held = held;
                    calls.lock().unwrap().push("slow");
                    slow_started.notify_one();
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    StatusCode::NOT_FOUND
                }
            })
        };
        let fast = {
            let calls = calls.clone();
            let slow_started = slow_started.clone();
            post(move || {
                let calls = calls.clone();
                let slow_started = slow_started.clone();
                async move {
                    calls.lock().unwrap().push("fast");
                    let _ = tokio::time::timeout(Duration::from_secs(2), slow_started.notified()).await;
                    Json(json!({"choices": [{"message": {"role": "assistant", "content": "fast"}}]}))
                }
            })
        };
        let upstream = Router::new()
            .route("/slow/completions", slow)
            .route("/fast/completions", fast);
        let (base_url, handle) = spawn_upstream(upstream).await;

        let mut config = test_config(&base_url);
        config.upstream_request_timeout = Duration::from_secs(30);
        config.candidates = vec![
            EndpointConfig::new("/slow/completions", RequestFormat::Standard),
            EndpointConfig::new("/fast/completions", RequestFormat::Standard),
        ];
        let forwarder = forwarder(&config);

        let started = std::time::Instant::now();
        let response = forwarder.forward(chat(false)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "fast");

        tokio::time::timeout(Duration::from_secs(2), released)
            .await
            .expect("losing attempt was left running")
            .unwrap_err();

        let mut seen = calls.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec!["fast", "slow"]);
        assert_eq!(forwarder.pool().get_overall_stats().active_connections, 0);

        let cached = forwarder.endpoints().get_best_endpoint(&base_url, "gpt-4").await;
        assert_eq!(cached.map(|e| e.path), Some("/fast/completions".to_string()));

        handle.abort();
    }

    #[tokio::test]
    #[traced_test]
    async fn non_streaming_completion_logs_upstream_model() {
        let upstream = Router::new().route(
            "/chat/completions",
            post(|| async {
                Json(json!({
                    "model": "gpt-4-0613",
                    "choices": [{"message": {"role": "assistant", "content": "hi"}}]
                }))
            }),
        );
        let (base_url, handle) = spawn_upstream(upstream).await;

        let mut config = test_config(&base_url);
        config.candidates = vec![EndpointConfig::new("/chat/completions", RequestFormat::Standard)];
        let forwarder = forwarder(&config);

        let target = forwarder.target().await.unwrap();
        let fetched = forwarder.fetch_completion(&target, &chat(false)).await.unwrap();
        let body: Value = serde_json::from_slice(&fetched.body).unwrap();
        assert_eq!(body["model"], "gpt-4-0613");

        assert!(logs_contain("upstream completion model"));
        assert!(logs_contain("model=gpt-4-0613"));

        handle.abort();
    }

    #[tokio::test]
    async fn all_candidates_failing_reports_attempt_count() {
        let upstream = Router::new().fallback(|| async { StatusCode::NOT_FOUND });
        let (base_url, handle) = spawn_upstream(upstream).await;

        let forwarder = forwarder(&test_config(&base_url));
        let err = forwarder.forward(chat(false)).await.unwrap_err();
        assert!(matches!(err, ForwardError::DiscoveryFailed { attempts: 4, .. }));
        assert_eq!(err.code(), "discovery_failed");
        assert!(forwarder.responses().is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn missing_token_fails_before_network() {
        let hits = Hits::default();
        let upstream = Router::new()
            .route("/chat/completions", post(slow_completion))
            .with_state(hits.clone());
        let (base_url, handle) = spawn_upstream(upstream).await;

        let mut config = test_config(&base_url);
        config.access_token = None;
        let forwarder = forwarder(&config);

        assert!(matches!(
            forwarder.forward(chat(false)).await,
            Err(ForwardError::Authentication)
        ));
        let mut sink = BufferSink::default();
        assert!(matches!(
            forwarder.forward_streaming(chat(true), None, &mut sink).await,
            Err(ForwardError::Authentication)
        ));
        assert_eq!(hits.0.load(Ordering::SeqCst), 0);

        handle.abort();
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_calling_upstream() {
        let hits = Hits::default();
        let upstream = Router::new()
            .route(
                "/chat/completions",
                post(|State(hits): State<Hits>| async move {
                    hits.0.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }),
            )
            .with_state(hits.clone());
        let (base_url, handle) = spawn_upstream(upstream).await;

        let mut config = test_config(&base_url);
        config.candidates = vec![EndpointConfig::new("/chat/completions", RequestFormat::Standard)];
        config.circuit_breaker.failure_threshold = 2;
        let forwarder = forwarder(&config);

        for _ in 0..2 {
            assert!(forwarder.forward(chat(false)).await.is_err());
        }
        assert_eq!(hits.0.load(Ordering::SeqCst), 2);

        let err = forwarder.forward(chat(false)).await.unwrap_err();
        assert_eq!(err.code(), "circuit_open");
        assert_eq!(hits.0.load(Ordering::SeqCst), 2);

        handle.abort();
    }

    #[tokio::test]
    async fn known_endpoint_is_retried_with_backoff() {
        let hits = Hits::default();
        let upstream = Router::new()
            .route(
                "/chat/completions",
                post(|State(hits): State<Hits>| async move {
                    if hits.0.fetch_add(1, Ordering::SeqCst) == 1 {
                        return StatusCode::SERVICE_UNAVAILABLE.into_response();
                    }
                    Json(json!({"choices": [{"message": {"role": "assistant", "content": "ok"}}]}))
                        .into_response()
                }),
            )
            .with_state(hits.clone());
        let (base_url, handle) = spawn_upstream(upstream).await;

        let mut config = test_config(&base_url);
        config.candidates = vec![EndpointConfig::new("/chat/completions", RequestFormat::Standard)];
        let forwarder = forwarder(&config);

        forwarder.forward(chat(false)).await.unwrap();
        let again = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "second"}]});
        let req = ChatRequest::parse(&serde_json::to_vec(&again).unwrap()).unwrap();
        forwarder.forward(req).await.unwrap();

        assert_eq!(hits.0.load(Ordering::SeqCst), 3);
        handle.abort();
    }

    #[tokio::test]
    async fn streaming_request_is_relayed_end_to_end() {
        let upstream = Router::new().route(
            "/chat/completions",
            post(|| async {
                let frames = [
                    r#"data: {"id":"u1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
                    r#"data: {"id":"u1","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
                    "data: [DONE]",
                ];
                (
                    [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                    frames.map(|f| format!("{f}\n\n")).concat(),
                )
            }),
        );
        let (base_url, handle) = spawn_upstream(upstream).await;

        let mut config = test_config(&base_url);
        config.candidates = vec![EndpointConfig::new("/chat/completions", RequestFormat::Standard)];
        let forwarder = forwarder(&config);

        let mut sink = BufferSink::default();
        let summary = forwarder
            .forward_streaming(chat(true), Some("client"), &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.outcome, StreamOutcome::Completed);
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.model.as_deref(), Some("gpt-4o"));
        let text = sink.text();
        assert!(text.contains("\"content\":\"Hel\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
        assert_eq!(forwarder.streams().active_count(), 0);
        assert_eq!(forwarder.pool().get_overall_stats().active_connections, 0);

        handle.abort();
    }
}
