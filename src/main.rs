use std::net::SocketAddr;
use std::time::Duration;

use copilot_gateway::GatewayConfig;
use ipnet::IpNet;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.trim().parse::<u32>().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse::<usize>().ok()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> anyhow::Result<Option<bool>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }

    let normalized = s.to_ascii_lowercase();
    let value = match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            return Err(anyhow::anyhow!(
                "invalid boolean value for {name}: {raw:?} (expected true/false)"
            ));
        }
    };

    Ok(Some(value))
}

fn parse_trusted_proxy_cidrs(raw: &str) -> anyhow::Result<Vec<IpNet>> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        for token in part.split_whitespace() {
            let net = token.parse::<IpNet>().map_err(|e| {
                anyhow::anyhow!("invalid CIDR in TRUSTED_PROXY_CIDRS: {token:?}: {e}")
            })?;
            out.push(net);
        }
    }
    Ok(out)
}

fn parse_model_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for model in raw.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        if !out.iter().any(|existing| existing == model) {
            out.push(model.to_string());
        }
    }
    out
}

fn config_from_env() -> anyhow::Result<GatewayConfig> {
    let mut cfg = GatewayConfig::default();

    cfg.access_token = env_string("COPILOT_TOKEN").or_else(|| env_string("GITHUB_COPILOT_TOKEN"));
    cfg.upstream_base_url = env_string("COPILOT_ENDPOINT");

    if let Some(value) = env_usize("MAX_REQUEST_BYTES") {
        cfg.max_request_bytes = value;
    }
    if let Some(raw) = env_string("MODELS") {
        let models = parse_model_list(&raw);
        if models.is_empty() {
            anyhow::bail!("MODELS must name at least one model");
        }
        cfg.models = models;
    }
    if let Some(ms) = env_u64("UPSTREAM_TIMEOUT_MS") {
        cfg.upstream_request_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = env_usize("WARMUP_CONNECTIONS") {
        cfg.warmup_connections = n;
    }
    if let Some(secs) = env_u64("METRICS_LOG_INTERVAL_SECS") {
        cfg.metrics_log_interval = Duration::from_secs(secs);
    }

    if let Some(n) = env_u32("MAX_RETRIES") {
        cfg.retry.max_retries = n;
    }

    if let Some(n) = env_u32("CIRCUIT_FAILURE_THRESHOLD") {
        cfg.circuit_breaker.failure_threshold = n;
    }
    if let Some(n) = env_u32("CIRCUIT_SUCCESS_THRESHOLD") {
        cfg.circuit_breaker.success_threshold = n;
    }
    if let Some(ms) = env_u64("CIRCUIT_RECOVERY_TIMEOUT_MS") {
        cfg.circuit_breaker.recovery_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("CIRCUIT_CALL_TIMEOUT_MS") {
        cfg.circuit_breaker.call_timeout = Duration::from_millis(ms);
    }

    if let Some(n) = env_usize("POOL_MAX_CONNECTIONS_PER_ORIGIN") {
        cfg.pool.max_connections_per_origin = n;
    }
    if let Some(n) = env_usize("POOL_MAX_TOTAL_CONNECTIONS") {
        cfg.pool.max_total_connections = n;
    }
    if let Some(ms) = env_u64("POOL_IDLE_TIMEOUT_MS") {
        cfg.pool.idle_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("POOL_CONNECT_TIMEOUT_MS") {
        cfg.pool.connect_timeout = Duration::from_millis(ms);
    }

    if let Some(n) = env_u32("ENDPOINT_FAILURE_THRESHOLD") {
        cfg.endpoint_cache.failure_threshold = n;
    }
    if let Some(secs) = env_u64("ENDPOINT_HEALTH_CHECK_INTERVAL_SECS") {
        cfg.endpoint_cache.health_check_interval = Duration::from_secs(secs);
    }

    if let Some(ms) = env_u64("RESPONSE_CACHE_TTL_MS") {
        cfg.response_cache.ttl = Duration::from_millis(ms);
    }
    if let Some(n) = env_usize("RESPONSE_CACHE_MAX_ENTRIES") {
        cfg.response_cache.max_entries = n;
    }

    if let Some(n) = env_usize("MAX_CONCURRENT_STREAMS") {
        cfg.streaming.max_concurrent_streams = n;
    }
    if let Some(n) = env_usize("STREAM_RATE_LIMIT") {
        cfg.streaming.rate_limit_max_requests = n;
    }
    if let Some(ms) = env_u64("STREAM_RATE_LIMIT_INTERVAL_MS") {
        cfg.streaming.rate_limit_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("STREAM_IDLE_TIMEOUT_MS") {
        cfg.streaming.idle_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("STREAM_TIMEOUT_MS") {
        cfg.streaming.stream_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_u64("STUCK_STREAM_THRESHOLD_MS") {
        cfg.streaming.stuck_stream_threshold = Duration::from_millis(ms);
    }

    if let Some(trust) = env_bool("TRUST_PROXY_HEADERS")? {
        cfg.trust_proxy_headers = trust;
    }
    if cfg.trust_proxy_headers {
        if let Some(raw) = env_string("TRUSTED_PROXY_CIDRS") {
            cfg.trusted_proxy_cidrs = parse_trusted_proxy_cidrs(&raw)?;
        }
    }

    Ok(cfg)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listen: SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8069".to_string())
        .parse()?;

    let cfg = config_from_env()?;
    if cfg.access_token.is_none() {
        tracing::warn!("COPILOT_TOKEN is not set; chat completions will be rejected");
    }

    let state = copilot_gateway::AppState::new(cfg)?;
    let background = copilot_gateway::spawn_background_tasks(&state);
    let app = copilot_gateway::app(state.clone());

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    for task in background {
        task.abort();
    }
    state.shutdown();
    tracing::info!("gateway stopped");

    Ok(())
}
