use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::circuit_breaker::CircuitError;
use crate::openai_error_response;
use crate::pool::PoolError;
use crate::request::ValidationError;

/// Failure of one forwarding pipeline operation.
///
/// The display form carries upstream detail for logs; clients only ever see
/// [`ForwardError::public_message`] and [`ForwardError::code`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ForwardError {
    #[error("no upstream access token available")]
    Authentication,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("circuit breaker open for {endpoint}")]
    CircuitOpen {
        endpoint: String,
        last_failure: Option<String>,
    },
    #[error("upstream {endpoint} timed out after {timeout:?}")]
    UpstreamTimeout { endpoint: String, timeout: Duration },
    #[error("network error calling {endpoint}: {message}")]
    Network { endpoint: String, message: String },
    #[error("upstream {endpoint} answered {status}")]
    UpstreamStatus { endpoint: String, status: u16 },
    #[error("invalid upstream response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },
    #[error("all {attempts} candidate endpoints failed (last: {last})")]
    DiscoveryFailed { attempts: usize, last: String },
    #[error("no free upstream connection to {origin}")]
    PoolExhausted { origin: String },
    #[error("client rate limit exceeded")]
    RateLimited { max_requests: usize, interval: Duration },
    #[error("concurrent stream limit of {limit} reached")]
    TooManyStreams { limit: usize },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ForwardError {
    pub fn from_pool(endpoint: &str, err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { origin, .. } => ForwardError::PoolExhausted { origin },
            PoolError::Timeout(timeout) => ForwardError::UpstreamTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            },
            PoolError::Closed => ForwardError::Internal("connection pool is closed".to_string()),
            other => ForwardError::Network {
                endpoint: endpoint.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn from_circuit(endpoint: &str, err: CircuitError<ForwardError>) -> Self {
        match err {
            CircuitError::Open { last_failure, .. } => ForwardError::CircuitOpen {
                endpoint: endpoint.to_string(),
                last_failure,
            },
            CircuitError::Timeout { timeout, .. } => ForwardError::UpstreamTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            },
            CircuitError::Failed { error, .. } => error,
        }
    }

    /// Worth another attempt against the same endpoint after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ForwardError::Network { .. } | ForwardError::UpstreamTimeout { .. } => true,
            ForwardError::UpstreamStatus { status, .. } => {
                matches!(*status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::Authentication => StatusCode::UNAUTHORIZED,
            ForwardError::Validation(_) => StatusCode::BAD_REQUEST,
            ForwardError::CircuitOpen { .. }
            | ForwardError::PoolExhausted { .. }
            | ForwardError::TooManyStreams { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ForwardError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::UpstreamStatus { status: 401 | 403, .. } => StatusCode::UNAUTHORIZED,
            ForwardError::UpstreamStatus { status: 429, .. } | ForwardError::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ForwardError::Network { .. }
            | ForwardError::UpstreamStatus { .. }
            | ForwardError::InvalidResponse { .. }
            | ForwardError::DiscoveryFailed { .. } => StatusCode::BAD_GATEWAY,
            ForwardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::Authentication => "authentication_error",
            ForwardError::Validation(_) => "invalid_request",
            ForwardError::CircuitOpen { .. } => "circuit_open",
            ForwardError::UpstreamTimeout { .. } => "upstream_timeout",
            ForwardError::UpstreamStatus { status: 401 | 403, .. } => "authentication_error",
            ForwardError::UpstreamStatus { status: 429, .. } => "upstream_rate_limited",
            ForwardError::Network { .. }
            | ForwardError::UpstreamStatus { .. }
            | ForwardError::InvalidResponse { .. } => "upstream_error",
            ForwardError::DiscoveryFailed { .. } => "discovery_failed",
            ForwardError::PoolExhausted { .. } => "pool_exhausted",
            ForwardError::RateLimited { .. } => "rate_limited",
            ForwardError::TooManyStreams { .. } => "too_many_streams",
            ForwardError::Internal(_) => "internal_error",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ForwardError::Authentication
            | ForwardError::UpstreamStatus { status: 401 | 403, .. } => "authentication_error",
            ForwardError::Validation(_) => "invalid_request_error",
            ForwardError::RateLimited { .. }
            | ForwardError::UpstreamStatus { status: 429, .. } => "rate_limit_error",
            _ => "server_error",
        }
    }

    /// Client-facing message; never includes upstream bodies, URLs or causes.
    pub fn public_message(&self) -> String {
        match self {
            ForwardError::Authentication => "no valid upstream credentials".to_string(),
            ForwardError::Validation(err) => err.message.clone(),
            ForwardError::CircuitOpen { .. } => {
                "upstream temporarily unavailable, retry later".to_string()
            }
            ForwardError::UpstreamTimeout { .. } => "upstream request timed out".to_string(),
            ForwardError::UpstreamStatus { status: 401 | 403, .. } => {
                "upstream rejected the credentials".to_string()
            }
            ForwardError::UpstreamStatus { status: 429, .. } => {
                "upstream rate limit reached".to_string()
            }
            ForwardError::Network { .. }
            | ForwardError::UpstreamStatus { .. }
            | ForwardError::InvalidResponse { .. } => "upstream request failed".to_string(),
            ForwardError::DiscoveryFailed { attempts, .. } => {
                format!("no working upstream endpoint ({attempts} attempts failed)")
            }
            ForwardError::PoolExhausted { .. } => "gateway is at connection capacity".to_string(),
            ForwardError::RateLimited {
                max_requests,
                interval,
            } => format!(
                "too many requests, at most {max_requests} per {}ms",
                interval.as_millis()
            ),
            ForwardError::TooManyStreams { .. } => {
                "too many concurrent streams, retry later".to_string()
            }
            ForwardError::Internal(_) => "internal gateway error".to_string(),
        }
    }

    fn param(&self) -> Option<&'static str> {
        match self {
            ForwardError::Validation(err) => err.param,
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for ForwardError {
    fn from(err: tokio::task::JoinError) -> Self {
        ForwardError::Internal(format!("request task failed: {err}"))
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        openai_error_response(
            self.status(),
            self.error_type(),
            &self.public_message(),
            self.param(),
            Some(self.code()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_message_hides_upstream_detail() {
        let err = ForwardError::Network {
            endpoint: "https://secret.internal/chat".to_string(),
            message: "connection reset by peer".to_string(),
        };
        assert!(err.to_string().contains("secret.internal"));
        assert!(!err.public_message().contains("secret"));
        assert_eq!(err.code(), "upstream_error");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn upstream_statuses_map_to_stable_codes() {
        let status = |status| ForwardError::UpstreamStatus {
            endpoint: "e".to_string(),
            status,
        };
        assert_eq!(status(401).code(), "authentication_error");
        assert_eq!(status(429).status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status(500).code(), "upstream_error");
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!ForwardError::Authentication.is_retryable());
    }

    #[test]
    fn rate_limit_message_reports_configured_limit() {
        let err = ForwardError::RateLimited {
            max_requests: 10,
            interval: Duration::from_secs(1),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            err.public_message(),
            "too many requests, at most 10 per 1000ms"
        );
    }

    #[test]
    fn pool_errors_convert_with_endpoint_context() {
        let err = ForwardError::from_pool(
            "https://api.example.com/chat",
            PoolError::Exhausted {
                origin: "https://api.example.com".to_string(),
                waited: Duration::from_secs(1),
            },
        );
        assert_eq!(err.code(), "pool_exhausted");

        let err = ForwardError::from_pool("e", PoolError::Timeout(Duration::from_secs(2)));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
