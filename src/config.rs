use std::time::Duration;

use ipnet::IpNet;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::endpoint_cache::EndpointCacheConfig;
use crate::pool::ConnectionPoolConfig;
use crate::request::{chat_completion_candidates, EndpointConfig};
use crate::response_cache::ResponseCacheConfig;
use crate::retry::RetryConfig;
use crate::streaming::StreamingConfig;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub max_request_bytes: usize,
    /// Advertised by `GET /v1/models`.
    pub models: Vec<String>,
    pub access_token: Option<String>,
    /// Falls back to the public Copilot API when unset.
    pub upstream_base_url: Option<String>,
    /// Bounds each upstream call until response headers (and, for JSON, the body) arrive.
    pub upstream_request_timeout: Duration,
    pub warmup_connections: usize,
    pub metrics_log_interval: Duration,
    pub trust_proxy_headers: bool,
    pub trusted_proxy_cidrs: Vec<IpNet>,
    pub candidates: Vec<EndpointConfig>,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub pool: ConnectionPoolConfig,
    pub endpoint_cache: EndpointCacheConfig,
    pub response_cache: ResponseCacheConfig,
    pub streaming: StreamingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 4 * 1_048_576,
            models: vec![
                "gpt-4o".to_string(),
                "gpt-4".to_string(),
                "gpt-3.5-turbo".to_string(),
            ],
            access_token: None,
            upstream_base_url: None,
            upstream_request_timeout: Duration::from_secs(60),
            warmup_connections: 2,
            metrics_log_interval: Duration::from_secs(60),
            trust_proxy_headers: false,
            trusted_proxy_cidrs: Vec::new(),
            candidates: chat_completion_candidates(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pool: ConnectionPoolConfig::default(),
            endpoint_cache: EndpointCacheConfig::default(),
            response_cache: ResponseCacheConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}
