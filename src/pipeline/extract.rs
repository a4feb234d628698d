//! Incremental JSON extraction from an accumulating model-output buffer.
//!
//! A streaming model emits its answer a few tokens at a time and may surround
//! the JSON with prose ("Here is the analysis: {…} Let me know…"). The
//! extractor looks for the **first** balanced `{…}` span in the buffer,
//! parses it, and on success drops everything up to and including that span.
//! Text after the span stays for the next attempt.
//!
//! ```text
//! buffer:  "prefix {\"a\":1,\"b\":{\"c\":2}} suffix"
//!                 └──────── parsed ───────┘
//! after:   " suffix"
//! ```
//!
//! A missing or unbalanced object is not an error: the caller retries once
//! more text has arrived. A balanced span that fails to parse is also kept,
//! so the buffer only ever shrinks by a successful extraction.
//!
//! Known limitation: that retained span is found first on every later
//! attempt. Prose such as `See note {A-101}.` ahead of the real object
//! therefore blocks every object behind it for the rest of the stream.

use crate::config::BraceMatching;
use serde_json::Value;
use tracing::{debug, trace};

/// Outcome of one extraction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// An object was parsed and its span removed from the buffer.
    Parsed(Value),
    /// No balanced object yet. Buffer unchanged.
    NoMatch,
    /// A balanced span was found but is not valid JSON. Buffer unchanged.
    Unparseable,
}

/// Accumulating text buffer with first-balanced-object extraction.
#[derive(Debug, Clone)]
pub struct JsonExtractor {
    buffer: String,
    mode: BraceMatching,
    received: usize,
    consumed: usize,
}

impl JsonExtractor {
    pub fn new(mode: BraceMatching) -> Self {
        Self {
            buffer: String::new(),
            mode,
            received: 0,
            consumed: 0,
        }
    }

    /// Append newly received text.
    pub fn push_str(&mut self, text: &str) {
        self.received += text.len();
        self.buffer.push_str(text);
    }

    /// Text not yet consumed by an extraction.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Bytes removed by successful extractions so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes received so far. Always `consumed() + buffer().len()`.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Try to take the first balanced object out of the buffer.
    pub fn try_extract(&mut self) -> Extraction {
        let Some((start, end)) = find_balanced_span(&self.buffer, self.mode) else {
            return Extraction::NoMatch;
        };

        match serde_json::from_str::<Value>(&self.buffer[start..end]) {
            Ok(value) => {
                trace!("Extracted object at {}..{} ({} bytes skipped)", start, end, start);
                self.buffer.drain(..end);
                self.consumed += end;
                debug_assert_eq!(self.consumed + self.buffer.len(), self.received);
                Extraction::Parsed(value)
            }
            Err(e) => {
                debug!("Balanced span at {}..{} did not parse: {}", start, end, e);
                Extraction::Unparseable
            }
        }
    }

    /// Extract objects until the buffer yields no more.
    pub fn drain_parsed(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Extraction::Parsed(value) = self.try_extract() {
            out.push(value);
        }
        out
    }
}

/// Byte range `start..end` of the first balanced `{…}` in `text`, if any.
///
/// Braces are ASCII, so scanning bytes never splits a UTF-8 sequence and the
/// returned range always lies on character boundaries.
pub fn find_balanced_span(text: &str, mode: BraceMatching) -> Option<(usize, usize)> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let string_aware = mode == BraceMatching::StringAware;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if string_aware => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, start + offset + 1));
                }
            }
            _ => {}
        }
    }
    None
}
