//! StreamRelay: SSE byte stream in, parsed JSON fragments out.
//!
//! ## Layers
//!
//! ```text
//! upstream bytes ─▶ LineBuffer ─▶ clean_sse_line ─▶ envelope ─▶ JsonExtractor ─▶ fragments
//!                   (split on \n)  (trim, data:,     (Gemini /    (first balanced
//!                                   [DONE])           OpenAI)      object)
//! ```
//!
//! Lines are split on the `\n` byte *before* UTF-8 decoding. A newline byte
//! never occurs inside a multi-byte sequence, so a complete line always holds
//! complete characters no matter where the transport cut the chunks.
//!
//! ## State machine
//!
//! ```text
//! Streaming ──(chunk)──▶ Streaming ──(upstream done)──▶ Draining ──▶ Closed
//!     │                                                   ▲
//!     └──────(error envelope / read error)────────────────┘ (Closed, with error)
//! ```
//!
//! In `Draining` the trailing unterminated line is processed and the buffer
//! gets one final extraction attempt.
//!
//! ## Cancellation
//!
//! [`spawn_relay`] runs the loop on its own task and hands back a channel
//! stream. When the receiver is dropped the task notices through
//! `Sender::closed()`, stops polling, and drops the upstream body, which
//! releases the HTTP connection.

use crate::config::{BraceMatching, DeltaFormat};
use crate::error::AnalysisError;
use crate::pipeline::extract::JsonExtractor;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Display;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// A boxed stream of parsed fragments, terminated early by an error item.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Value, AnalysisError>> + Send>>;

const SSE_DATA_PREFIX: &str = "data:";
const SSE_DONE: &str = "[DONE]";
const RELAY_CHANNEL_CAPACITY: usize = 16;

// ── Byte-level buffers ───────────────────────────────────────────────────────

/// Splits a byte stream into complete lines, keeping the unterminated tail.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed, without the `\n`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete[..last_newline]
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Take the unterminated tail at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&tail).into_owned())
    }
}

/// Incremental UTF-8 decoder for unframed text streams.
///
/// Holds back an incomplete trailing sequence until the next chunk; invalid
/// bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }
}

/// Normalise one SSE line: trim, skip blanks and the `[DONE]` sentinel,
/// strip a `data:` prefix.
pub fn clean_sse_line(line: &str) -> Option<&str> {
    let mut line = line.trim();
    if let Some(rest) = line.strip_prefix(SSE_DATA_PREFIX) {
        line = rest.trim();
    }
    if line.is_empty() || line == SSE_DONE {
        return None;
    }
    Some(line)
}

// ── Envelopes ────────────────────────────────────────────────────────────────

/// Error body both providers use: `{"error": {"code": …, "message": "…"}}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiEnvelope {
    Error { error: ErrorBody },
    Chunk(GeminiChunk),
}

#[derive(Debug, Deserialize)]
struct GeminiChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OpenAiEnvelope {
    Error { error: ErrorBody },
    Chunk(OpenAiChunk),
}

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: Option<OpenAiDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What one SSE line carried.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Model text to append (may be empty).
    Text(String),
    /// Upstream reported an error inside the stream.
    Error { code: Option<i64>, message: String },
}

/// Decode one cleaned SSE line in the given envelope format.
///
/// Only the first candidate/choice is read. All of its Gemini text parts are
/// concatenated.
pub fn decode_envelope(format: DeltaFormat, line: &str) -> Result<Delta, serde_json::Error> {
    let delta = match format {
        DeltaFormat::Gemini => match serde_json::from_str::<GeminiEnvelope>(line)? {
            GeminiEnvelope::Error { error } => error.into(),
            GeminiEnvelope::Chunk(chunk) => Delta::Text(
                chunk
                    .candidates
                    .into_iter()
                    .next()
                    .and_then(|c| c.content)
                    .map(|content| {
                        content
                            .parts
                            .into_iter()
                            .filter_map(|p| p.text)
                            .collect::<String>()
                    })
                    .unwrap_or_default(),
            ),
        },
        DeltaFormat::OpenAi => match serde_json::from_str::<OpenAiEnvelope>(line)? {
            OpenAiEnvelope::Error { error } => error.into(),
            OpenAiEnvelope::Chunk(chunk) => Delta::Text(
                chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta)
                    .and_then(|d| d.content)
                    .unwrap_or_default(),
            ),
        },
    };
    Ok(delta)
}

impl From<ErrorBody> for Delta {
    fn from(body: ErrorBody) -> Self {
        Delta::Error {
            code: body.code.as_ref().and_then(Value::as_i64),
            message: body.message,
        }
    }
}

// ── Relay ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Streaming,
    Draining,
    Closed,
}

/// Synchronous core of the relay: feed chunks, collect fragments.
#[derive(Debug)]
pub struct StreamRelay {
    lines: LineBuffer,
    extractor: JsonExtractor,
    format: DeltaFormat,
    state: RelayState,
    skipped_lines: usize,
}

impl StreamRelay {
    pub fn new(format: DeltaFormat, mode: BraceMatching) -> Self {
        Self {
            lines: LineBuffer::default(),
            extractor: JsonExtractor::new(mode),
            format,
            state: RelayState::Streaming,
            skipped_lines: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Model text received but not yet consumed by an extraction.
    pub fn pending_text(&self) -> &str {
        self.extractor.buffer()
    }

    /// Lines dropped as protocol noise.
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Process one upstream chunk. Fragments completed by it are returned in
    /// discovery order.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Value>, AnalysisError> {
        if self.state != RelayState::Streaming {
            return Ok(Vec::new());
        }
        for line in self.lines.push(chunk) {
            self.handle_line(&line)?;
        }
        Ok(self.extractor.drain_parsed())
    }

    /// Upstream is done: process the trailing line, try a final extraction
    /// and close.
    pub fn finish(&mut self) -> Result<Vec<Value>, AnalysisError> {
        if self.state != RelayState::Streaming {
            return Ok(Vec::new());
        }
        self.state = RelayState::Draining;
        if let Some(tail) = self.lines.finish() {
            self.handle_line(&tail)?;
        }
        let fragments = self.extractor.drain_parsed();
        if !self.extractor.buffer().trim().is_empty() {
            debug!(
                "Stream ended with {} unconsumed bytes of model text",
                self.extractor.buffer().len()
            );
        }
        self.state = RelayState::Closed;
        Ok(fragments)
    }

    fn handle_line(&mut self, raw: &str) -> Result<(), AnalysisError> {
        let Some(line) = clean_sse_line(raw) else {
            return Ok(());
        };
        match decode_envelope(self.format, line) {
            Ok(Delta::Text(text)) => {
                self.extractor.push_str(&text);
                Ok(())
            }
            Ok(Delta::Error { code, message }) => {
                self.state = RelayState::Closed;
                Err(AnalysisError::UpstreamEnvelope { code, message })
            }
            Err(e) => {
                self.skipped_lines += 1;
                warn!("Skipping unparseable stream line ({}): {:.120}", e, line);
                Ok(())
            }
        }
    }
}

/// Drive `relay` over `upstream` on a background task.
///
/// The returned stream yields each fragment as soon as it is extracted, then
/// ends. Upstream read errors, error envelopes and an exhausted `budget`
/// arrive as a final `Err` item.
pub fn spawn_relay<S, B, E>(upstream: S, relay: StreamRelay, budget: Duration) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(run_relay(Box::pin(upstream), relay, tx, budget));
    Box::pin(ReceiverStream::new(rx))
}

async fn run_relay<B, E>(
    mut upstream: Pin<Box<dyn Stream<Item = Result<B, E>> + Send>>,
    mut relay: StreamRelay,
    tx: mpsc::Sender<Result<Value, AnalysisError>>,
    budget: Duration,
) where
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let deadline = Instant::now() + budget;
    let mut emitted = 0usize;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                info!("Downstream closed after {} fragments; releasing upstream", emitted);
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = tx
                    .send(Err(AnalysisError::Timeout {
                        stage: "Structured analysis stream",
                        secs: budget.as_secs(),
                    }))
                    .await;
                return;
            }
            next = upstream.next() => next,
        };

        let result = match next {
            Some(Ok(chunk)) => relay.feed(chunk.as_ref()),
            Some(Err(e)) => Err(AnalysisError::StreamRead {
                detail: e.to_string(),
            }),
            None => relay.finish(),
        };
        let done = relay.state() == RelayState::Closed;

        match result {
            Ok(fragments) => {
                for fragment in fragments {
                    if tx.send(Ok(fragment)).await.is_err() {
                        return;
                    }
                    emitted += 1;
                }
            }
            Err(e) => {
                warn!("Relay stopped: {}", e);
                let _ = tx.send(Err(e)).await;
                return;
            }
        }

        if done {
            debug!(
                "Relay closed: {} fragments, {} noise lines skipped, {} chars unconsumed",
                emitted,
                relay.skipped_lines(),
                relay.pending_text().chars().count()
            );
            return;
        }
    }
}
