use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequest, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tower_http::compression::CompressionLayer;

pub mod circuit_breaker;
pub mod config;
pub mod credentials;
pub mod endpoint_cache;
pub mod error;
pub mod forwarder;
pub mod pool;
pub mod request;
pub mod response;
pub mod response_cache;
pub mod retry;
pub mod streaming;

#[cfg(test)]
mod test_support;

use circuit_breaker::{BreakerHealth, CircuitBreakerStats};
pub use config::GatewayConfig;
use credentials::{CredentialProvider, StaticCredentials};
use endpoint_cache::{EndpointCacheEntryView, EndpointCacheStats};
pub use error::ForwardError;
use forwarder::Forwarder;
use pool::{OriginStats, PoolStats};
use request::ChatRequest;
use response_cache::ResponseCacheStats;
use streaming::{ChannelSink, StreamMetrics, StreamSessionView};

#[derive(Clone)]
pub struct AppState {
    config: Arc<GatewayConfig>,
    forwarder: Arc<Forwarder>,
    models: Arc<ModelCatalog>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let credentials = Arc::new(StaticCredentials::new(
            config.access_token.clone(),
            config.upstream_base_url.clone(),
        ));
        Self::with_credentials(config, credentials)
    }

    pub fn with_credentials(
        config: GatewayConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> anyhow::Result<Self> {
        let forwarder = Forwarder::new(&config, credentials)?;
        let models = ModelCatalog::new(&config.models)?;
        Ok(Self {
            config: Arc::new(config),
            forwarder: Arc::new(forwarder),
            models: Arc::new(models),
            started_at: Instant::now(),
        })
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    /// Stops accepting upstream work; in-flight responses keep their connections.
    pub fn shutdown(&self) {
        self.forwarder.pool().close();
        self.forwarder.pool().log_stats();
        self.forwarder.streams().log_metrics();
    }
}

pub fn spawn_background_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    state.forwarder.spawn_background_tasks()
}

pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;
    Router::new()
        .route("/", get(healthz))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(CompressionLayer::new())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "message": "copilot gateway is running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

const MODELS_CACHE_CONTROL: &str = "public, max-age=300";

/// The model list never changes at runtime, so its body and ETag are built once.
#[derive(Debug)]
struct ModelCatalog {
    body: Bytes,
    etag: HeaderValue,
}

impl ModelCatalog {
    fn new(models: &[String]) -> anyhow::Result<Self> {
        let list = ModelList {
            object: "list".to_string(),
            data: models
                .iter()
                .map(|id| ModelEntry {
                    id: id.clone(),
                    object: "model".to_string(),
                    created: 0,
                    owned_by: "github-copilot".to_string(),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&list)?;
        let digest = Sha256::digest(&body);
        let tag: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        let etag = HeaderValue::from_str(&format!("\"{tag}\""))?;
        Ok(Self {
            body: Bytes::from(body),
            etag,
        })
    }

    fn matches(&self, headers: &HeaderMap) -> bool {
        let Some(raw) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let ours = self.etag.as_bytes();
        raw.split(',').map(str::trim).any(|candidate| {
            candidate == "*" || candidate.trim_start_matches("W/").as_bytes() == ours
        })
    }
}

async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let catalog = &state.models;
    let mut resp = if catalog.matches(&headers) {
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::NOT_MODIFIED;
        resp
    } else {
        let mut resp = Response::new(Body::from(catalog.body.clone()));
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    };
    let out = resp.headers_mut();
    out.insert(ETAG, catalog.etag.clone());
    out.insert(CACHE_CONTROL, HeaderValue::from_static(MODELS_CACHE_CONTROL));
    resp
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Uptime {
    seconds: u64,
    human: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionPoolReport {
    #[serde(flatten)]
    overall: PoolStats,
    origins: Vec<OriginStats>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CircuitBreakerReport {
    health: BreakerHealth,
    breakers: Vec<CircuitBreakerStats>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointCacheReport {
    #[serde(flatten)]
    stats: EndpointCacheStats,
    endpoints: Vec<EndpointCacheEntryView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsReport {
    uptime: Uptime,
    #[serde(flatten)]
    streams: StreamMetrics,
    connection_pool: ConnectionPoolReport,
    circuit_breakers: CircuitBreakerReport,
    response_cache: ResponseCacheStats,
    endpoint_cache: EndpointCacheReport,
    active_streams: Vec<StreamSessionView>,
}

fn format_uptime(seconds: u64) -> String {
    let (hours, rest) = (seconds / 3600, seconds % 3600);
    format!("{hours}h {}m {}s", rest / 60, rest % 60)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let forwarder = &state.forwarder;
    let seconds = state.started_at.elapsed().as_secs();

    let mut response_cache = forwarder.responses().stats();
    response_cache.in_flight = forwarder.deduplicator().in_flight_count();
    response_cache.deduplicated = forwarder.deduplicator().joined();

    let report = Json(MetricsReport {
        uptime: Uptime {
            seconds,
            human: format_uptime(seconds),
        },
        streams: forwarder.streams().metrics(),
        connection_pool: ConnectionPoolReport {
            overall: forwarder.pool().get_overall_stats(),
            origins: forwarder.pool().get_all_stats(),
        },
        circuit_breakers: CircuitBreakerReport {
            health: forwarder.breakers().health(),
            breakers: forwarder.breakers().snapshot(),
        },
        response_cache,
        endpoint_cache: EndpointCacheReport {
            stats: forwarder.endpoints().stats().await,
            endpoints: forwarder.endpoints().snapshot().await,
        },
        active_streams: forwarder.streams().active_streams(),
    });
    ([(CACHE_CONTROL, HeaderValue::from_static("no-store"))], report)
}

async fn chat_completions(State(state): State<AppState>, request: Request) -> Response {
    let connect_info = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .cloned();
    let headers = request.headers().clone();

    let body = match Bytes::from_request(request, &state).await {
        Ok(body) => body,
        Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
            return openai_error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid_request_error",
                "request body too large",
                None,
                Some("request_too_large"),
            );
        }
        Err(_) => {
            return openai_error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "failed to read request body",
                None,
                Some("invalid_body"),
            );
        }
    };

    let req = match ChatRequest::parse(&body) {
        Ok(req) => req,
        Err(err) => return ForwardError::from(err).into_response(),
    };

    if !req.is_stream() {
        return match state.forwarder.forward(req).await {
            Ok(resp) => {
                let mut out = Response::new(Body::from(resp.body));
                *out.status_mut() = resp.status;
                let headers = out.headers_mut();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                headers.insert("x-cache", HeaderValue::from_static(resp.cache.as_str()));
                out
            }
            Err(err) => {
                tracing::warn!(error = %err, code = err.code(), "chat completion failed");
                err.into_response()
            }
        };
    }

    let client_key = derive_client_key(&state.config, &headers, &connect_info);
    let prepared = match state
        .forwarder
        .open_stream(req, client_key.as_deref())
        .await
    {
        Ok(prepared) => prepared,
        Err(err) => {
            tracing::warn!(error = %err, code = err.code(), "stream could not be opened");
            return err.into_response();
        }
    };

    let (mut sink, frames) = ChannelSink::new(state.forwarder.streams().config().channel_capacity);
    tokio::spawn(async move {
        prepared.relay(&mut sink).await;
    });

    let mut resp = Response::new(Body::from_stream(frames));
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}

fn parse_leftmost_x_forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    if let Ok(ip) = first.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = first.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    None
}

fn is_trusted_proxy(peer_ip: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&peer_ip))
}

fn requester_ip(
    config: &GatewayConfig,
    headers: &HeaderMap,
    connect_info: &Option<ConnectInfo<SocketAddr>>,
) -> Option<IpAddr> {
    let peer_ip = connect_info.as_ref().map(|ConnectInfo(addr)| addr.ip())?;

    if !config.trust_proxy_headers || !is_trusted_proxy(peer_ip, &config.trusted_proxy_cidrs) {
        return Some(peer_ip);
    }

    Some(parse_leftmost_x_forwarded_for(headers).unwrap_or(peer_ip))
}

/// Identity used for per-client stream rate limiting.
fn derive_client_key(
    config: &GatewayConfig,
    headers: &HeaderMap,
    connect_info: &Option<ConnectInfo<SocketAddr>>,
) -> Option<String> {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    {
        let token = auth.trim().strip_prefix("Bearer").unwrap_or(auth).trim();

        if !token.is_empty() {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            return Some(format!("auth:{:016x}", hasher.finish()));
        }
    }

    requester_ip(config, headers, connect_info).map(|ip| format!("ip:{ip}"))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiError,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn openai_error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    param: Option<&str>,
    code: Option<&str>,
) -> Response {
    let body = OpenAiErrorResponse {
        error: OpenAiError {
            message: message.to_string(),
            error_type: error_type.to_string(),
            param: param.map(ToString::to_string),
            code: code.map(ToString::to_string),
        },
    };
    (status, Json(body)).into_response()
}
