//! Chunk ingestion: newline-delimited JSON envelopes to message deltas.
//!
//! Two envelope shapes are accepted and normalized to [`Delta`]:
//!
//! - Ollama native: `{"message": {"content": "...", "function_call": {...}}}`
//! - OpenAI-compatible: `{"choices": [{"delta": {"content": "...", "function_call": {...}}}]}`

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::directive::FunctionCall;
use crate::providers::shared::extract_error_message;

/// A logical event extracted from one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text(String),
    FunctionCall(FunctionCall),
    /// In-band error reported by the model server.
    Error(String),
}

/// Byte-level line splitter.
///
/// Works on bytes so a multi-byte character split across two chunks is
/// reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let mut complete: Vec<u8> = self.buffer.drain(..=last_newline).collect();
        complete.pop();
        complete.split(|&b| b == b'\n').map(strip_cr).collect()
    }

    /// Takes the unterminated tail, leaving the buffer empty.
    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(strip_cr(&std::mem::take(&mut self.buffer)))
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn strip_cr(line: &[u8]) -> Vec<u8> {
    line.strip_suffix(b"\r").unwrap_or(line).to_vec()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    message: Option<MessagePart>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagePart {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
    #[serde(default)]
    tool_calls: Vec<ToolCallPart>,
}

#[derive(Debug, Deserialize)]
struct ToolCallPart {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<MessagePart>,
}

/// Turns raw transport chunks into [`Delta`]s, skipping malformed lines.
#[derive(Debug, Default)]
pub struct LineIngestor {
    lines: LineBuffer,
    malformed: usize,
}

impl LineIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Delta> {
        let mut deltas = Vec::new();
        for line in self.lines.push(chunk) {
            self.handle_line(&line, &mut deltas);
        }
        deltas
    }

    /// Parses the final unterminated line, if any.
    pub fn finish(&mut self) -> Vec<Delta> {
        let mut deltas = Vec::new();
        if let Some(line) = self.lines.take_remainder() {
            self.handle_line(&line, &mut deltas);
        }
        deltas
    }

    /// Number of lines discarded so far.
    pub fn malformed_lines(&self) -> usize {
        self.malformed
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn handle_line(&mut self, line: &[u8], deltas: &mut Vec<Delta>) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(err) => {
                self.malformed += 1;
                warn!(error = %err, len = line.len(), "Discarding non-UTF-8 stream line");
                return;
            }
        };

        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => normalize(envelope, deltas),
            Err(err) => {
                self.malformed += 1;
                warn!(error = %err, line = %truncate(text, 200), "Discarding malformed stream line");
            }
        }
    }
}

fn normalize(envelope: Envelope, deltas: &mut Vec<Delta>) {
    if let Some(error) = &envelope.error {
        let message = extract_error_message(&serde_json::json!({ "error": error }))
            .unwrap_or_else(|| error.to_string());
        deltas.push(Delta::Error(message));
        return;
    }

    let parts = envelope
        .message
        .into_iter()
        .chain(envelope.choices.into_iter().filter_map(|choice| choice.delta));

    let before = deltas.len();
    for part in parts {
        if let Some(content) = part.content.filter(|c| !c.is_empty()) {
            deltas.push(Delta::Text(content));
        }
        if let Some(call) = part.function_call {
            deltas.push(Delta::FunctionCall(call));
        }
        deltas.extend(
            part.tool_calls
                .into_iter()
                .map(|tool| Delta::FunctionCall(tool.function)),
        );
    }
    if deltas.len() == before {
        debug!("Envelope carried no content");
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
