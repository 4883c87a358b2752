use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close again.
    pub success_threshold: u32,
    /// How long an open breaker rejects calls before probing.
    pub recovery_timeout: Duration,
    /// Per-call deadline applied around the wrapped operation.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

const LATENCY_EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn to_int(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_int(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure surfaced by [`CircuitBreaker::execute`].
///
/// The underlying failure is always carried along, either as the wrapped error or
/// as the recorded message of the failure that opened the breaker.
#[derive(Debug)]
pub enum CircuitError<E> {
    /// Rejected without running the operation.
    Open {
        name: String,
        last_failure: Option<String>,
    },
    /// The operation did not finish within the call timeout.
    Timeout {
        name: String,
        timeout: Duration,
        tripped: bool,
    },
    /// The operation ran and failed; `tripped` is set when this failure opened the breaker.
    Failed {
        name: String,
        error: E,
        tripped: bool,
    },
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    pub fn tripped(&self) -> bool {
        match self {
            CircuitError::Open { .. } => false,
            CircuitError::Timeout { tripped, .. } | CircuitError::Failed { tripped, .. } => {
                *tripped
            }
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { name, last_failure } => match last_failure {
                Some(cause) => write!(f, "circuit breaker {name} is open (last failure: {cause})"),
                None => write!(f, "circuit breaker {name} is open"),
            },
            CircuitError::Timeout {
                name,
                timeout,
                tripped,
            } => {
                write!(f, "call through circuit breaker {name} timed out after {timeout:?}")?;
                if *tripped {
                    f.write_str("; breaker tripped")?;
                }
                Ok(())
            }
            CircuitError::Failed {
                name,
                error,
                tripped,
            } => {
                if *tripped {
                    write!(f, "circuit breaker {name} tripped: {error}")
                } else {
                    write!(f, "call through circuit breaker {name} failed: {error}")
                }
            }
        }
    }
}

impl<E> std::error::Error for CircuitError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitError::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[inline]
fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

enum Admission {
    Admitted { probe: bool },
    Rejected,
}

/// Clears the half-open probe slot even when the wrapped call is cancelled.
struct ProbeSlot<'a>(&'a AtomicBool);

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct LatencyStats {
    average_ms: Option<f64>,
    last_failure: Option<String>,
}

/// Failure/success state machine for one named resource.
///
/// State checks are lock-free; only latency bookkeeping takes a short mutex.
/// While half-open, a single probe call is admitted at a time and any concurrent
/// caller is rejected as if the breaker were still open.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    opened_at_ms: AtomicU64,
    probe_in_flight: AtomicBool,
    latency: Mutex<LatencyStats>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            latency: Mutex::new(LatencyStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let current = CircuitState::from_int(self.state.load(Ordering::Acquire));
        if current != CircuitState::Open {
            return current;
        }

        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let recovery_ms = self.config.recovery_timeout.as_millis() as u64;
        if now_ms().saturating_sub(opened_at) < recovery_ms {
            return CircuitState::Open;
        }

        if self
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_HALF_OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.consecutive_failures.store(0, Ordering::Release);
            self.consecutive_successes.store(0, Ordering::Release);
            tracing::info!(breaker = %self.name, "circuit breaker open -> half_open");
            return CircuitState::HalfOpen;
        }

        CircuitState::from_int(self.state.load(Ordering::Acquire))
    }

    /// Runs `op` if the breaker admits it, bounding it by the configured call timeout.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let probe = match self.admit() {
            Admission::Admitted { probe } => probe,
            Admission::Rejected => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(CircuitError::Open {
                    name: self.name.clone(),
                    last_failure: self.last_failure(),
                });
            }
        };
        let _probe_slot = probe.then(|| ProbeSlot(&self.probe_in_flight));

        let started = Instant::now();
        match tokio::time::timeout(self.config.call_timeout, op()).await {
            Ok(Ok(value)) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Ok(Err(error)) => {
                let tripped = self.record_failure(started.elapsed(), error.to_string());
                Err(CircuitError::Failed {
                    name: self.name.clone(),
                    error,
                    tripped,
                })
            }
            Err(_) => {
                let timeout = self.config.call_timeout;
                let tripped = self.record_failure(
                    started.elapsed(),
                    format!("timed out after {}ms", timeout.as_millis()),
                );
                Err(CircuitError::Timeout {
                    name: self.name.clone(),
                    timeout,
                    tripped,
                })
            }
        }
    }

    fn admit(&self) -> Admission {
        match self.state() {
            CircuitState::Closed => Admission::Admitted { probe: false },
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Admission::Admitted { probe: true }
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.observe_latency(latency, None);
        self.consecutive_failures.store(0, Ordering::Release);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;

        match CircuitState::from_int(self.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen if successes >= self.config.success_threshold => {
                self.transition_to(CircuitState::Closed);
            }
            CircuitState::Open => {
                tracing::debug!(breaker = %self.name, "success recorded while circuit is open");
            }
            _ => {}
        }
    }

    /// Returns `true` when this failure moved the breaker into the open state.
    pub fn record_failure(&self, latency: Duration, cause: String) -> bool {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.observe_latency(latency, Some(cause));
        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match CircuitState::from_int(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                self.transition_to(CircuitState::Open)
            }
            CircuitState::HalfOpen => self.transition_to(CircuitState::Open),
            _ => false,
        }
    }

    fn observe_latency(&self, latency: Duration, failure: Option<String>) {
        let sample = latency.as_secs_f64() * 1000.0;
        let mut stats = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        stats.average_ms = Some(match stats.average_ms {
            Some(avg) => avg + LATENCY_EWMA_ALPHA * (sample - avg),
            None => sample,
        });
        if failure.is_some() {
            stats.last_failure = failure;
        }
    }

    fn transition_to(&self, new_state: CircuitState) -> bool {
        let old_state = CircuitState::from_int(self.state.swap(new_state.to_int(), Ordering::AcqRel));
        if old_state == new_state {
            return false;
        }

        match new_state {
            CircuitState::Open => {
                self.opened_at_ms.store(now_ms(), Ordering::Release);
                self.consecutive_successes.store(0, Ordering::Release);
                tracing::warn!(
                    breaker = %self.name,
                    from = old_state.as_str(),
                    last_failure = ?self.last_failure(),
                    "circuit breaker tripped"
                );
            }
            CircuitState::Closed | CircuitState::HalfOpen => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.consecutive_successes.store(0, Ordering::Release);
                tracing::info!(
                    breaker = %self.name,
                    from = old_state.as_str(),
                    to = new_state.as_str(),
                    "circuit breaker state transition"
                );
            }
        }
        true
    }

    pub fn reset(&self) {
        self.transition_to(CircuitState::Closed);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
    }

    pub fn force_open(&self) {
        self.transition_to(CircuitState::Open);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Acquire)
    }

    fn last_failure(&self) -> Option<String> {
        self.latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_failure
            .clone()
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state();
        let (average_latency_ms, last_failure) = {
            let stats = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
            (stats.average_ms.unwrap_or(0.0), stats.last_failure.clone())
        };
        let open_for_ms = (state == CircuitState::Open)
            .then(|| now_ms().saturating_sub(self.opened_at_ms.load(Ordering::Acquire)));

        CircuitBreakerStats {
            name: self.name.clone(),
            state,
            consecutive_failures: self.consecutive_failures(),
            consecutive_successes: self.consecutive_successes(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            average_latency_ms,
            open_for_ms,
            last_failure,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub average_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_for_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerHealth {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

/// Lazily creates one breaker per resource name, all sharing a config.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn health(&self) -> BreakerHealth {
        let mut health = BreakerHealth::default();
        for breaker in self.all() {
            health.total += 1;
            match breaker.state() {
                CircuitState::Closed => health.closed += 1,
                CircuitState::Open => health.open += 1,
                CircuitState::HalfOpen => health.half_open += 1,
            }
        }
        health
    }

    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> =
            self.all().iter().map(|breaker| breaker.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn log_health(&self) {
        let health = self.health();
        if health.total == 0 {
            return;
        }
        if health.open > 0 || health.half_open > 0 {
            tracing::warn!(
                total = health.total,
                closed = health.closed,
                open = health.open,
                half_open = health.half_open,
                "circuit breaker health"
            );
        } else {
            tracing::info!(total = health.total, closed = health.closed, "circuit breaker health");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn breaker(failure_threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 2,
                recovery_timeout: Duration::from_millis(recovery_ms),
                call_timeout: Duration::from_millis(200),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> CircuitError<String> {
        cb.execute(|| async { Err::<(), _>("boom".to_string()) })
            .await
            .unwrap_err()
    }

    async fn succeed(cb: &CircuitBreaker) {
        cb.execute(|| async { Ok::<_, String>(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn starts_closed_and_passes_values_through() {
        let cb = breaker(3, 1_000);
        assert_eq!(cb.state(), CircuitState::Closed);

        let value = cb.execute(|| async { Ok::<_, String>(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(cb.stats().total_successes, 1);
    }

    #[tokio::test]
    async fn opens_after_failure_threshold_and_marks_tripping_failure() {
        let cb = breaker(3, 10_000);

        assert!(!fail(&cb).await.tripped());
        assert!(!fail(&cb).await.tripped());
        let third = fail(&cb).await;
        assert!(third.tripped());
        assert!(third.to_string().contains("boom"));

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn open_breaker_rejects_fast_without_running_operation() {
        let cb = breaker(1, 10_000);
        fail(&cb).await;

        let calls = AtomicUsize::new(0);
        let started = Instant::now();
        let err = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(5));
        assert!(err.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match err {
            CircuitError::Open { last_failure, .. } => {
                assert_eq!(last_failure.as_deref(), Some("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cb.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn half_open_after_recovery_timeout_then_closes_on_successes() {
        let cb = breaker(1, 50);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = breaker(1, 50);
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let err = fail(&cb).await;
        assert!(err.tripped());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_admits_a_single_probe_at_a_time() {
        let cb = Arc::new(breaker(1, 30));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            probe_cb
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let concurrent = fail(&cb).await;
        assert!(concurrent.is_open());

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let cb = breaker(1, 10_000);
        let err = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CircuitError::Timeout { tripped: true, .. }));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().total_failures, 1);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let cb = breaker(3, 10_000);
        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await;
        assert_eq!(cb.consecutive_failures(), 0);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn reset_and_force_open() {
        let cb = breaker(3, 10_000);
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_creates_one_breaker_per_name_and_reports_health() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let a = registry.get_or_create("https://a/chat");
        let again = registry.get_or_create("https://a/chat");
        assert!(Arc::ptr_eq(&a, &again));

        let b = registry.get_or_create("https://b/chat");
        fail(&b).await;

        let health = registry.health();
        assert_eq!(
            health,
            BreakerHealth {
                total: 2,
                closed: 1,
                open: 1,
                half_open: 0
            }
        );

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].name, "https://b/chat");
        assert_eq!(snapshot[1].state, CircuitState::Open);
    }
}
