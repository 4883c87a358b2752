use std::time::{Duration, Instant};

use axum::body::Bytes;
use serde::Serialize;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Done,
    Data(String),
    /// Comments, `event:`/`id:` fields and blank separators.
    Other,
}

pub fn parse_line(line: &str) -> SseLine {
    let Some(rest) = line.strip_prefix("data:") else {
        return SseLine::Other;
    };
    let payload = rest.strip_prefix(' ').unwrap_or(rest).trim_end();
    if payload == "[DONE]" {
        SseLine::Done
    } else if payload.is_empty() {
        SseLine::Other
    } else {
        SseLine::Data(payload.to_string())
    }
}

pub fn data_frame<T: Serialize>(payload: &T) -> Result<Bytes, serde_json::Error> {
    let mut frame = b"data: ".to_vec();
    serde_json::to_writer(&mut frame, payload)?;
    frame.extend_from_slice(b"\n\n");
    Ok(Bytes::from(frame))
}

pub fn error_frame(code: &str, message: &str) -> Bytes {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "stream_error",
            "code": code,
        }
    });
    Bytes::from(format!("data: {body}\n\n"))
}

/// Splits an SSE byte stream into lines.
///
/// Bytes after the last newline stay buffered, so a multi-byte character cut
/// across two reads is decoded only once its line is complete.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    /// Whatever is left once the upstream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest);
        Some(String::from_utf8_lossy(rest).into_owned())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Byte offsets just past each top-level JSON object in `text`.
fn object_boundaries(text: &str) -> Vec<usize> {
    let mut boundaries = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, byte) in text.bytes().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    boundaries.push(idx + 1);
                }
            }
            _ => {}
        }
    }
    boundaries
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Cuts an oversized frame into pieces of at most `threshold` bytes where possible.
///
/// Concatenated JSON objects are cut between objects; anything else is cut at
/// fixed offsets (moved back to the nearest character boundary).
pub fn split_frame(frame: &str, threshold: usize) -> Vec<String> {
    let threshold = threshold.max(1);
    if frame.len() <= threshold {
        return vec![frame.to_string()];
    }

    let boundaries = object_boundaries(frame);
    let mut pieces = Vec::new();
    let mut start = 0;

    if boundaries.len() >= 2 {
        let mut last_cut_candidate = None;
        for boundary in boundaries {
            if boundary - start > threshold {
                if let Some(cut) = last_cut_candidate.take() {
                    pieces.push(frame[start..cut].to_string());
                    start = cut;
                }
            }
            last_cut_candidate = Some(boundary);
        }
        pieces.push(frame[start..].to_string());
        return pieces;
    }

    while frame.len() - start > threshold {
        let mut cut = floor_char_boundary(frame, start + threshold);
        if cut == start {
            cut = (start + threshold..=frame.len())
                .find(|idx| frame.is_char_boundary(*idx))
                .unwrap_or(frame.len());
        }
        pieces.push(frame[start..cut].to_string());
        start = cut;
    }
    if start < frame.len() {
        pieces.push(frame[start..].to_string());
    }
    pieces
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub buffer_threshold: usize,
    pub chunk_delay: Duration,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    /// Backpressure seen within this window keeps the multiplier from growing.
    pub backpressure_window: Duration,
    /// Writes faster than this count as evidence the client keeps up.
    pub fast_write: Duration,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: 16 * 1024,
            chunk_delay: Duration::from_millis(5),
            min_multiplier: 0.25,
            max_multiplier: 4.0,
            backpressure_window: Duration::from_secs(1),
            fast_write: Duration::from_millis(2),
        }
    }
}

/// Per-stream split threshold and inter-piece delay, scaled by recent client behaviour.
#[derive(Debug)]
pub struct AdaptiveChunker {
    config: ChunkingConfig,
    multiplier: f64,
    last_backpressure: Option<Instant>,
}

impl AdaptiveChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            config,
            multiplier: 1.0,
            last_backpressure: None,
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn threshold(&self) -> usize {
        ((self.config.buffer_threshold as f64 * self.multiplier) as usize).max(64)
    }

    pub fn delay(&self) -> Duration {
        self.config.chunk_delay.mul_f64(self.multiplier)
    }

    pub fn on_backpressure(&mut self) {
        self.last_backpressure = Some(Instant::now());
        self.multiplier = (self.multiplier * 0.5).max(self.config.min_multiplier);
    }

    pub fn on_write(&mut self, took: Duration) {
        let recent_backpressure = self
            .last_backpressure
            .is_some_and(|at| at.elapsed() < self.config.backpressure_window);
        if !recent_backpressure && took <= self.config.fast_write {
            self.multiplier = (self.multiplier * 1.25).min(self.config.max_multiplier);
        }
    }
}
