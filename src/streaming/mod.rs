//! Relays upstream SSE completions to clients.
//!
//! A [`StreamRelay`] owns the set of live sessions, admission control and the
//! aggregate metrics. Each admitted stream gets a [`StreamTicket`] whose
//! [`StreamTicket::relay`] drives one upstream byte stream into a
//! [`StreamSink`] until `[DONE]`, an error, a timeout or a client abort.

pub mod frames;
pub mod sink;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::ForwardError;
use crate::response::{completion_id, transform_chunk, unix_now, ChunkDefaults, UpstreamPayload};

pub use frames::{AdaptiveChunker, ChunkingConfig, LineBuffer, SseLine, DONE_FRAME};
pub use sink::{BufferSink, ChannelSink, SinkClosed, StreamSink, WriteOutcome};

use frames::{data_frame, error_frame, parse_line, split_frame};

/// Upper bound on the closing frames written to a client that has stopped reading.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub max_concurrent_streams: usize,
    /// Stream starts allowed per client within `rate_limit_interval`; 0 disables the limit.
    pub rate_limit_max_requests: usize,
    pub rate_limit_interval: Duration,
    pub idle_timeout: Duration,
    pub stream_timeout: Duration,
    pub stuck_stream_threshold: Duration,
    pub sweep_interval: Duration,
    pub channel_capacity: usize,
    pub chunking: ChunkingConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            rate_limit_max_requests: 10,
            rate_limit_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(300),
            stuck_stream_threshold: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            channel_capacity: 32,
            chunking: ChunkingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(&'static str),
}

impl StreamOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamOutcome::Completed)
    }
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOutcome::Completed => f.write_str("completed"),
            StreamOutcome::Failed(code) => f.write_str(code),
        }
    }
}

#[derive(Debug)]
pub struct StreamSession {
    id: String,
    client_key: Option<String>,
    started: Instant,
    last_activity: Mutex<Instant>,
    bytes: AtomicU64,
    chunks: AtomicU64,
    backpressure_events: AtomicU64,
    model: OnceLock<String>,
    cancel: Notify,
}

impl StreamSession {
    fn new(client_key: Option<&str>) -> Self {
        let now = Instant::now();
        Self {
            id: format!("stream-{}", uuid::Uuid::new_v4().simple()),
            client_key: client_key.map(ToString::to_string),
            started: now,
            last_activity: Mutex::new(now),
            bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            model: OnceLock::new(),
            cancel: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> Option<&str> {
        self.model.get().map(String::as_str)
    }

    /// Returns true only for the call that actually set the model.
    fn record_model(&self, model: &str) -> bool {
        self.model.set(model.to_string()).is_ok()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn view(&self) -> StreamSessionView {
        StreamSessionView {
            id: self.id.clone(),
            model: self.model().map(ToString::to_string),
            age_ms: self.started.elapsed().as_millis() as u64,
            idle_ms: self.idle_for().as_millis() as u64,
            bytes: self.bytes.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSessionView {
    pub id: String,
    pub model: Option<String>,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub bytes: u64,
    pub chunks: u64,
    pub backpressure_events: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCounts {
    pub active: usize,
    pub max_concurrent: usize,
    pub peak_concurrent: usize,
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPerformance {
    pub total_chunks: u64,
    pub total_bytes: u64,
    pub average_stream_duration: f64,
    pub chunks_per_second: f64,
    pub bytes_per_second: f64,
    pub backpressure_events: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitingStats {
    pub active_clients: usize,
    pub interval_ms: u64,
    pub max_requests_per_interval: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetrics {
    pub streams: StreamCounts,
    pub performance: StreamPerformance,
    pub rate_limiting: RateLimitingStats,
}

#[derive(Debug, Default)]
struct StreamTotals {
    started: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    chunks: AtomicU64,
    bytes: AtomicU64,
    duration_ms: AtomicU64,
    backpressure_events: AtomicU64,
}

/// Live stream sessions plus admission control and aggregate metrics.
#[derive(Debug)]
pub struct StreamRelay {
    config: StreamingConfig,
    sessions: Mutex<HashMap<String, Arc<StreamSession>>>,
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
    peak_concurrent: AtomicUsize,
    totals: StreamTotals,
}

impl StreamRelay {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            peak_concurrent: AtomicUsize::new(0),
            totals: StreamTotals::default(),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    fn check_rate_limit(&self, client_key: &str) -> Result<(), ForwardError> {
        let max = self.config.rate_limit_max_requests;
        if max == 0 {
            return Ok(());
        }

        let interval = self.config.rate_limit_interval;
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|_, hits| {
            while hits.front().is_some_and(|at| now.duration_since(*at) >= interval) {
                hits.pop_front();
            }
            !hits.is_empty()
        });

        let hits = clients.entry(client_key.to_string()).or_default();
        if hits.len() >= max {
            tracing::warn!(client = %client_key, max, "stream rate limit exceeded");
            return Err(ForwardError::RateLimited {
                max_requests: max,
                interval,
            });
        }
        hits.push_back(now);
        Ok(())
    }

    /// Admits a new stream or rejects it immediately; nothing is queued.
    pub fn admit(self: &Arc<Self>, client_key: Option<&str>) -> Result<StreamTicket, ForwardError> {
        if let Some(key) = client_key {
            self.check_rate_limit(key)?;
        }

        let session = Arc::new(StreamSession::new(client_key));
        {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let limit = self.config.max_concurrent_streams;
            if sessions.len() >= limit {
                tracing::warn!(active = sessions.len(), limit, "rejecting stream: too many concurrent streams");
                return Err(ForwardError::TooManyStreams { limit });
            }
            sessions.insert(session.id.clone(), session.clone());
            self.peak_concurrent
                .fetch_max(sessions.len(), Ordering::Relaxed);
        }
        self.totals.started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(stream_id = %session.id, client = ?session.client_key, "stream admitted");

        Ok(StreamTicket {
            relay: self.clone(),
            session,
        })
    }

    /// Removes a session and accounts for it; only the call that removed it counts.
    fn finish(&self, id: &str, outcome: StreamOutcome) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(session) = removed else {
            return false;
        };

        let duration = session.started.elapsed();
        let totals = &self.totals;
        match outcome {
            StreamOutcome::Completed => totals.successful.fetch_add(1, Ordering::Relaxed),
            StreamOutcome::Failed(_) => totals.failed.fetch_add(1, Ordering::Relaxed),
        };
        totals
            .chunks
            .fetch_add(session.chunks.load(Ordering::Relaxed), Ordering::Relaxed);
        totals
            .bytes
            .fetch_add(session.bytes.load(Ordering::Relaxed), Ordering::Relaxed);
        totals
            .duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);

        tracing::info!(
            stream_id = %session.id,
            model = session.model().unwrap_or("unknown"),
            outcome = %outcome,
            chunks = session.chunks.load(Ordering::Relaxed),
            bytes = session.bytes.load(Ordering::Relaxed),
            backpressure_events = session.backpressure_events.load(Ordering::Relaxed),
            duration_ms = duration.as_millis() as u64,
            "stream finished"
        );
        true
    }

    /// Force-closes sessions older than the stuck-stream threshold.
    pub fn sweep_stuck_streams(&self) -> usize {
        let threshold = self.config.stuck_stream_threshold;
        let stuck: Vec<Arc<StreamSession>> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|session| session.started.elapsed() >= threshold)
            .cloned()
            .collect();

        let mut closed = 0;
        for session in stuck {
            if self.finish(&session.id, StreamOutcome::Failed("stream_stuck")) {
                tracing::warn!(
                    stream_id = %session.id,
                    age_ms = session.started.elapsed().as_millis() as u64,
                    "closed stuck stream"
                );
                session.cancel.notify_one();
                closed += 1;
            }
        }
        closed
    }

    pub fn start_stuck_stream_sweep(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.sweep_interval.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_stuck_streams();
            }
        })
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn active_streams(&self) -> Vec<StreamSessionView> {
        let mut views: Vec<StreamSessionView> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|session| session.view())
            .collect();
        views.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        views
    }

    pub fn metrics(&self) -> StreamMetrics {
        let totals = &self.totals;
        let successful = totals.successful.load(Ordering::Relaxed);
        let failed = totals.failed.load(Ordering::Relaxed);
        let finished = successful + failed;
        let chunks = totals.chunks.load(Ordering::Relaxed);
        let bytes = totals.bytes.load(Ordering::Relaxed);
        let duration_ms = totals.duration_ms.load(Ordering::Relaxed);
        let duration_secs = duration_ms as f64 / 1000.0;

        let active_clients = {
            let now = Instant::now();
            let interval = self.config.rate_limit_interval;
            self.clients
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .filter(|hits| hits.back().is_some_and(|at| now.duration_since(*at) < interval))
                .count()
        };

        StreamMetrics {
            streams: StreamCounts {
                active: self.active_count(),
                max_concurrent: self.config.max_concurrent_streams,
                peak_concurrent: self.peak_concurrent.load(Ordering::Relaxed),
                total: totals.started.load(Ordering::Relaxed),
                successful,
                failed,
                success_rate: if finished > 0 {
                    successful as f64 * 100.0 / finished as f64
                } else {
                    0.0
                },
            },
            performance: StreamPerformance {
                total_chunks: chunks,
                total_bytes: bytes,
                average_stream_duration: if finished > 0 {
                    duration_ms as f64 / finished as f64
                } else {
                    0.0
                },
                chunks_per_second: if duration_secs > 0.0 {
                    chunks as f64 / duration_secs
                } else {
                    0.0
                },
                bytes_per_second: if duration_secs > 0.0 {
                    bytes as f64 / duration_secs
                } else {
                    0.0
                },
                backpressure_events: totals.backpressure_events.load(Ordering::Relaxed),
            },
            rate_limiting: RateLimitingStats {
                active_clients,
                interval_ms: self.config.rate_limit_interval.as_millis() as u64,
                max_requests_per_interval: self.config.rate_limit_max_requests,
            },
        }
    }

    pub fn log_metrics(&self) {
        let metrics = self.metrics();
        if metrics.streams.total == 0 {
            return;
        }
        tracing::info!(
            active = metrics.streams.active,
            peak = metrics.streams.peak_concurrent,
            total = metrics.streams.total,
            successful = metrics.streams.successful,
            failed = metrics.streams.failed,
            backpressure_events = metrics.performance.backpressure_events,
            "stream relay stats"
        );
    }
}

#[derive(Debug, Clone)]
pub struct RelaySummary {
    pub stream_id: String,
    pub model: Option<String>,
    pub chunks: u64,
    pub skipped: u64,
    pub bytes: u64,
    pub outcome: StreamOutcome,
}

enum Termination {
    Done,
    UpstreamEnded,
    ClientGone,
    Idle,
    Overall,
    Stuck,
    Upstream(String),
}

enum LineResult {
    Continue,
    Done,
    ClientGone,
}

/// An admitted stream. Dropping it without relaying counts the stream as failed.
#[derive(Debug)]
pub struct StreamTicket {
    relay: Arc<StreamRelay>,
    session: Arc<StreamSession>,
}

impl Drop for StreamTicket {
    fn drop(&mut self) {
        self.relay
            .finish(&self.session.id, StreamOutcome::Failed("stream_abandoned"));
    }
}

impl StreamTicket {
    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub async fn relay<S, E, K>(self, mut upstream: S, requested_model: &str, sink: &mut K) -> RelaySummary
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: fmt::Display,
        K: StreamSink + ?Sized,
    {
        let config = self.relay.config.clone();
        let session = self.session.clone();
        let defaults = ChunkDefaults {
            id: completion_id(),
            model: requested_model.to_string(),
            created: unix_now(),
        };
        let mut lines = LineBuffer::new();
        let mut chunker = AdaptiveChunker::new(config.chunking.clone());
        let mut skipped = 0u64;
        let mut aborted = sink.on_abort();
        let overall = tokio::time::sleep(config.stream_timeout);
        tokio::pin!(overall);

        let termination = 'relay: loop {
            let read = tokio::select! {
                biased;
                _ = &mut aborted => break Termination::ClientGone,
                _ = session.cancel.notified() => break Termination::Stuck,
                _ = &mut overall => break Termination::Overall,
                read = tokio::time::timeout(config.idle_timeout, upstream.next()) => read,
            };
            let bytes = match read {
                Err(_) => break Termination::Idle,
                Ok(None) => break Termination::UpstreamEnded,
                Ok(Some(Err(err))) => break Termination::Upstream(err.to_string()),
                Ok(Some(Ok(bytes))) => bytes,
            };
            session.touch();

            // A client that stops reading blocks the write, so writes race the same signals.
            let pending = lines.push(&bytes);
            let written = async {
                for line in pending {
                    match self
                        .relay_line(&line, &defaults, &mut chunker, &mut *sink, &mut skipped)
                        .await
                    {
                        LineResult::Continue => {}
                        LineResult::Done => return Some(Termination::Done),
                        LineResult::ClientGone => return Some(Termination::ClientGone),
                    }
                }
                None
            };
            let interrupted = tokio::select! {
                biased;
                _ = &mut aborted => Some(Termination::ClientGone),
                _ = session.cancel.notified() => Some(Termination::Stuck),
                _ = &mut overall => Some(Termination::Overall),
                written = written => written,
            };
            if let Some(termination) = interrupted {
                break 'relay termination;
            }
        };
        drop(upstream);

        let termination = match termination {
            Termination::UpstreamEnded => match lines.finish() {
                Some(line) => {
                    let last = tokio::time::timeout(
                        CLOSE_WRITE_TIMEOUT,
                        self.relay_line(&line, &defaults, &mut chunker, &mut *sink, &mut skipped),
                    )
                    .await;
                    match last {
                        Ok(LineResult::Done) => Termination::Done,
                        Ok(LineResult::ClientGone) | Err(_) => Termination::ClientGone,
                        Ok(LineResult::Continue) => Termination::UpstreamEnded,
                    }
                }
                None => Termination::UpstreamEnded,
            },
            other => other,
        };

        let relayed = session.chunks.load(Ordering::Relaxed);
        let outcome = match termination {
            Termination::Done => {
                close_stream(sink).await;
                StreamOutcome::Completed
            }
            Termination::UpstreamEnded if relayed > 0 => {
                tracing::debug!(stream_id = %session.id, "upstream ended without [DONE]");
                close_stream(sink).await;
                StreamOutcome::Completed
            }
            Termination::UpstreamEnded => {
                fail_stream(sink, "stream_error", "upstream closed the stream without data").await
            }
            Termination::ClientGone => {
                tracing::info!(stream_id = %session.id, "client disconnected from stream");
                StreamOutcome::Failed("client_aborted")
            }
            Termination::Idle => {
                tracing::warn!(
                    stream_id = %session.id,
                    idle_timeout_ms = config.idle_timeout.as_millis() as u64,
                    "upstream stream idle, aborting"
                );
                fail_stream(sink, "stream_timeout", "upstream stopped sending data").await
            }
            Termination::Overall => {
                tracing::warn!(stream_id = %session.id, "stream exceeded maximum duration");
                fail_stream(sink, "stream_timeout", "stream exceeded maximum duration").await
            }
            Termination::Stuck => {
                fail_stream(sink, "stream_stuck", "stream was closed by the gateway").await
            }
            Termination::Upstream(message) => {
                tracing::warn!(stream_id = %session.id, error = %message, "upstream stream failed");
                fail_stream(sink, "stream_error", "upstream stream failed").await
            }
        };

        self.relay.finish(&session.id, outcome);
        RelaySummary {
            stream_id: session.id.clone(),
            model: session.model().map(ToString::to_string),
            chunks: session.chunks.load(Ordering::Relaxed),
            skipped,
            bytes: session.bytes.load(Ordering::Relaxed),
            outcome,
        }
    }

    async fn relay_line<K>(
        &self,
        line: &str,
        defaults: &ChunkDefaults,
        chunker: &mut AdaptiveChunker,
        sink: &mut K,
        skipped: &mut u64,
    ) -> LineResult
    where
        K: StreamSink + ?Sized,
    {
        let payload = match parse_line(line) {
            SseLine::Other => return LineResult::Continue,
            SseLine::Done => return LineResult::Done,
            SseLine::Data(payload) => payload,
        };

        let parsed: UpstreamPayload = match serde_json::from_str(&payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                *skipped += 1;
                tracing::warn!(stream_id = %self.session.id, error = %err, "skipping malformed upstream chunk");
                return LineResult::Continue;
            }
        };
        if let Some(model) = parsed.model.as_deref() {
            if self.session.record_model(model) {
                tracing::debug!(stream_id = %self.session.id, model, "stream model");
            }
        }

        let frame = match data_frame(&transform_chunk(parsed, defaults)) {
            Ok(frame) => frame,
            Err(err) => {
                *skipped += 1;
                tracing::warn!(stream_id = %self.session.id, error = %err, "failed to encode chunk");
                return LineResult::Continue;
            }
        };

        match self.write_chunked(frame, chunker, sink).await {
            Ok(()) => {
                self.session.chunks.fetch_add(1, Ordering::Relaxed);
                LineResult::Continue
            }
            Err(SinkClosed) => LineResult::ClientGone,
        }
    }

    async fn write_chunked<K>(
        &self,
        frame: Bytes,
        chunker: &mut AdaptiveChunker,
        sink: &mut K,
    ) -> Result<(), SinkClosed>
    where
        K: StreamSink + ?Sized,
    {
        let threshold = chunker.threshold();
        if frame.len() <= threshold {
            return self.write_piece(frame, chunker, sink).await;
        }

        let text = String::from_utf8_lossy(&frame).into_owned();
        let pieces = split_frame(&text, threshold);
        let last = pieces.len().saturating_sub(1);
        for (idx, piece) in pieces.into_iter().enumerate() {
            self.write_piece(Bytes::from(piece), chunker, sink).await?;
            if idx < last {
                tokio::time::sleep(chunker.delay()).await;
            }
        }
        Ok(())
    }

    async fn write_piece<K>(
        &self,
        piece: Bytes,
        chunker: &mut AdaptiveChunker,
        sink: &mut K,
    ) -> Result<(), SinkClosed>
    where
        K: StreamSink + ?Sized,
    {
        let len = piece.len() as u64;
        let started = Instant::now();
        let outcome = sink.write_frame(piece).await?;
        self.session.bytes.fetch_add(len, Ordering::Relaxed);

        if outcome.backpressure {
            self.session
                .backpressure_events
                .fetch_add(1, Ordering::Relaxed);
            self.relay
                .totals
                .backpressure_events
                .fetch_add(1, Ordering::Relaxed);
            chunker.on_backpressure();
        } else {
            chunker.on_write(started.elapsed());
        }
        Ok(())
    }
}

async fn close_stream<K>(sink: &mut K)
where
    K: StreamSink + ?Sized,
{
    let _ = tokio::time::timeout(CLOSE_WRITE_TIMEOUT, sink.done()).await;
}

/// Sends an error frame and `[DONE]`, giving up if the client is not reading.
async fn fail_stream<K>(sink: &mut K, code: &'static str, message: &str) -> StreamOutcome
where
    K: StreamSink + ?Sized,
{
    let closing = async {
        sink.write_frame(error_frame(code, message)).await?;
        sink.done().await
    };
    if tokio::time::timeout(CLOSE_WRITE_TIMEOUT, closing).await.is_err() {
        tracing::debug!(code, "client not reading, dropped closing frames");
    }
    StreamOutcome::Failed(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::stream;
    use serde_json::{json, Value};

    type Upstream = stream::BoxStream<'static, Result<Bytes, std::io::Error>>;

    fn relay_with(config: StreamingConfig) -> Arc<StreamRelay> {
        Arc::new(StreamRelay::new(config))
    }

    fn chunk_frame(content: &str) -> String {
        let chunk = json!({
            "id": "chatcmpl-up",
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
        });
        format!("data: {chunk}\n\n")
    }

    fn upstream_of(parts: Vec<String>) -> Upstream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p)))).boxed()
    }

    fn data_payloads(text: &str) -> Vec<String> {
        text.split("\n\n")
            .filter_map(|frame| frame.strip_prefix("data: "))
            .map(ToString::to_string)
            .collect()
    }

    #[tokio::test]
    async fn relays_every_frame_in_order_then_done() {
        let relay = relay_with(StreamingConfig::default());
        let mut parts: Vec<String> = (0..5).map(|i| chunk_frame(&format!("t{i}"))).collect();
        parts.push("data: [DONE]\n\n".to_string());

        let mut sink = BufferSink::default();
        let ticket = relay.admit(Some("client")).unwrap();
        let summary = ticket.relay(upstream_of(parts), "gpt-4", &mut sink).await;

        assert_eq!(summary.outcome, StreamOutcome::Completed);
        assert_eq!(summary.chunks, 5);
        assert_eq!(summary.model.as_deref(), Some("gpt-4o"));

        let payloads = data_payloads(&sink.text());
        assert_eq!(payloads.len(), 6);
        for (i, payload) in payloads[..5].iter().enumerate() {
            let chunk: Value = serde_json::from_str(payload).unwrap();
            assert_eq!(chunk["object"], "chat.completion.chunk");
            assert_eq!(chunk["choices"][0]["delta"]["content"], format!("t{i}"));
        }
        assert_eq!(payloads[5], "[DONE]");
        assert_eq!(relay.active_count(), 0);
        assert_eq!(relay.metrics().streams.successful, 1);
    }

    #[tokio::test]
    async fn malformed_chunk_is_skipped_without_aborting() {
        let relay = relay_with(StreamingConfig::default());
        let mut parts: Vec<String> = (0..10)
            .map(|i| {
                if i == 4 {
                    "data: {not json\n\n".to_string()
                } else {
                    chunk_frame("x")
                }
            })
            .collect();
        parts.push("data: [DONE]\n\n".to_string());

        let mut sink = BufferSink::default();
        let summary = relay
            .admit(None)
            .unwrap()
            .relay(upstream_of(parts), "gpt-4", &mut sink)
            .await;

        assert_eq!(summary.chunks, 9);
        assert_eq!(summary.skipped, 1);
        let payloads = data_payloads(&sink.text());
        assert_eq!(payloads.len(), 10);
        assert_eq!(payloads.iter().filter(|p| *p == "[DONE]").count(), 1);
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let relay = relay_with(StreamingConfig::default());
        let whole = format!("{}{}data: [DONE]\n\n", chunk_frame("héllo"), chunk_frame("wörld"));
        let bytes = whole.into_bytes();
        let parts: Vec<Result<Bytes, std::io::Error>> = bytes
            .chunks(7)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();

        let mut sink = BufferSink::default();
        let summary = relay
            .admit(None)
            .unwrap()
            .relay(stream::iter(parts), "gpt-4", &mut sink)
            .await;

        assert_eq!(summary.chunks, 2);
        assert!(sink.text().contains("héllo"));
        assert!(sink.text().contains("wörld"));
    }

    #[tokio::test]
    async fn upstream_end_without_done_still_terminates_client() {
        let relay = relay_with(StreamingConfig::default());
        let mut sink = BufferSink::default();
        let summary = relay
            .admit(None)
            .unwrap()
            .relay(upstream_of(vec![chunk_frame("a")]), "gpt-4", &mut sink)
            .await;

        assert_eq!(summary.outcome, StreamOutcome::Completed);
        assert!(sink.text().ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn idle_upstream_times_out_with_error_frame() {
        let relay = relay_with(StreamingConfig {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let upstream = upstream_of(vec![chunk_frame("first")])
            .chain(stream::pending())
            .boxed();

        let mut sink = BufferSink::default();
        let ticket = relay.admit(Some("c")).unwrap();
        assert_eq!(relay.active_count(), 1);
        let summary = ticket.relay(upstream, "gpt-4", &mut sink).await;

        assert_eq!(summary.outcome, StreamOutcome::Failed("stream_timeout"));
        let payloads = data_payloads(&sink.text());
        assert_eq!(payloads.len(), 3);
        let error: Value = serde_json::from_str(&payloads[1]).unwrap();
        assert_eq!(error["error"]["code"], "stream_timeout");
        assert_eq!(payloads[2], "[DONE]");

        assert_eq!(relay.active_count(), 0);
        assert_eq!(relay.metrics().streams.failed, 1);
    }

    #[tokio::test]
    async fn client_abort_releases_upstream_and_session() {
        let relay = relay_with(StreamingConfig::default());
        let (mut sink, rx) = ChannelSink::with_receiver(4);
        let upstream = upstream_of(vec![chunk_frame("a")])
            .chain(stream::pending())
            .boxed();

        let ticket = relay.admit(None).unwrap();
        let handle = tokio::spawn(async move { ticket.relay(upstream, "gpt-4", &mut sink).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);

        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.outcome, StreamOutcome::Failed("client_aborted"));
        assert_eq!(relay.active_count(), 0);
    }

    #[tokio::test]
    async fn stuck_sweep_closes_stream_and_counts_once() {
        let relay = relay_with(StreamingConfig {
            stuck_stream_threshold: Duration::from_millis(20),
            ..Default::default()
        });
        let ticket = relay.admit(None).unwrap();
        let upstream: Upstream = stream::pending().boxed();
        let handle = tokio::spawn(async move {
            let mut sink = BufferSink::default();
            let summary = ticket.relay(upstream, "gpt-4", &mut sink).await;
            (summary, sink.text())
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(relay.sweep_stuck_streams(), 1);

        let (summary, text) = handle.await.unwrap();
        assert_eq!(summary.outcome, StreamOutcome::Failed("stream_stuck"));
        assert!(text.contains("stream_stuck"));

        let metrics = relay.metrics();
        assert_eq!(metrics.streams.failed, 1);
        assert_eq!(metrics.streams.successful, 0);
    }

    #[tokio::test]
    async fn admission_enforces_concurrency_and_rate_limits() {
        let relay = relay_with(StreamingConfig {
            max_concurrent_streams: 1,
            rate_limit_max_requests: 2,
            rate_limit_interval: Duration::from_secs(60),
            ..Default::default()
        });

        let held = relay.admit(Some("a")).unwrap();
        assert!(matches!(
            relay.admit(Some("b")),
            Err(ForwardError::TooManyStreams { limit: 1 })
        ));
        drop(held);

        relay.admit(Some("a")).map(drop).unwrap();
        assert!(matches!(
            relay.admit(Some("a")),
            Err(ForwardError::RateLimited { max_requests: 2, .. })
        ));

        let metrics = relay.metrics();
        assert_eq!(metrics.streams.peak_concurrent, 1);
        assert_eq!(metrics.streams.failed, 2);
        assert_eq!(metrics.rate_limiting.active_clients, 2);
    }

    #[tokio::test]
    async fn oversized_frames_are_written_in_pieces() {
        let relay = relay_with(StreamingConfig {
            chunking: ChunkingConfig {
                buffer_threshold: 64,
                chunk_delay: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        });
        let long = "x".repeat(400);
        let parts = vec![chunk_frame(&long), "data: [DONE]\n\n".to_string()];

        let mut sink = BufferSink::default();
        let summary = relay
            .admit(None)
            .unwrap()
            .relay(upstream_of(parts), "gpt-4", &mut sink)
            .await;

        assert_eq!(summary.chunks, 1);
        assert!(sink.frames.len() > 2);
        let payloads = data_payloads(&sink.text());
        let chunk: Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], long);
    }

    /// Upstream that has sent `frames` chunks and then stalls; `released` fires once it is dropped.
    fn stalled_upstream(frames: usize) -> (Upstream, tokio::sync::oneshot::Receiver<()>) {
        let (guard, released) = tokio::sync::oneshot::channel::<()>();
        let parts = (0..frames).map(|i| chunk_frame(&format!("c{i}"))).collect();
        let upstream = upstream_of(parts)
            .chain(stream::pending().map(move |item: Result<Bytes, std::io::Error>| {
                let _held = &guard;
                item
            }))
            .boxed();
        (upstream, released)
    }

    #[tokio::test]
    async fn overall_timeout_fires_while_client_is_not_reading() {
        let relay = relay_with(StreamingConfig {
            stream_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let (mut sink, _unread) = ChannelSink::with_receiver(1);
        let (upstream, released) = stalled_upstream(10);

        let ticket = relay.admit(None).unwrap();
        let handle = tokio::spawn(async move { ticket.relay(upstream, "gpt-4", &mut sink).await });

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("relay stayed blocked on a full channel")
            .unwrap();
        assert_eq!(summary.outcome, StreamOutcome::Failed("stream_timeout"));
        assert!(released.await.is_err());
        assert_eq!(relay.active_count(), 0);
        assert_eq!(relay.metrics().streams.failed, 1);
    }

    #[tokio::test]
    async fn stuck_sweep_unblocks_relay_writing_to_unread_client() {
        let relay = relay_with(StreamingConfig {
            stuck_stream_threshold: Duration::from_millis(50),
            ..Default::default()
        });
        let (mut sink, _unread) = ChannelSink::with_receiver(1);
        let (upstream, released) = stalled_upstream(10);

        let ticket = relay.admit(None).unwrap();
        let handle = tokio::spawn(async move { ticket.relay(upstream, "gpt-4", &mut sink).await });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(relay.sweep_stuck_streams(), 1);
        assert_eq!(relay.active_count(), 0);

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("relay stayed blocked after the sweep")
            .unwrap();
        assert_eq!(summary.outcome, StreamOutcome::Failed("stream_stuck"));
        assert!(summary.chunks < 10);
        assert!(released.await.is_err());
        assert_eq!(relay.metrics().streams.failed, 1);
    }
}
