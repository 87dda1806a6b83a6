//! Stream events and their SSE wire framing.
//!
//! Every generation is framed as one `START_THINKING`, any number of
//! `AI_RESPONSE` fragments, and one `STOP_THINKING`. Each frame is a single
//! `data: <json>\n\n` record.

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Message carried by the terminal frame.
pub const DONE_MESSAGE: &str = "### Done!";

/// What the relay tells a client about one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ThinkingStarted,
    Fragment(String),
    ThinkingStopped,
}

/// The `type` tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    StartThinking,
    AiResponse,
    StopThinking,
}

/// JSON body of one SSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub message: String,
}

impl From<&StreamEvent> for WireEvent {
    fn from(event: &StreamEvent) -> Self {
        match event {
            StreamEvent::ThinkingStarted => WireEvent {
                kind: EventKind::StartThinking,
                message: String::new(),
            },
            StreamEvent::Fragment(text) => WireEvent {
                kind: EventKind::AiResponse,
                message: text.clone(),
            },
            StreamEvent::ThinkingStopped => WireEvent {
                kind: EventKind::StopThinking,
                message: DONE_MESSAGE.to_string(),
            },
        }
    }
}

impl From<WireEvent> for StreamEvent {
    fn from(wire: WireEvent) -> Self {
        match wire.kind {
            EventKind::StartThinking => StreamEvent::ThinkingStarted,
            EventKind::AiResponse => StreamEvent::Fragment(wire.message),
            EventKind::StopThinking => StreamEvent::ThinkingStopped,
        }
    }
}

impl StreamEvent {
    /// Render as a complete SSE frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> Result<String> {
        let json = serde_json::to_string(&WireEvent::from(self))?;
        Ok(format!("data: {}\n\n", json))
    }

    /// Parse the payload of a `data:` line back into an event.
    pub fn from_data(payload: &str) -> Result<Self> {
        let wire: WireEvent = serde_json::from_str(payload)
            .map_err(|e| RelayError::Decode(format!("{e}: {payload}")))?;
        Ok(wire.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::ThinkingStopped)
    }
}

// ---------------------------------------------------------------------------
// Incremental SSE decoding
// ---------------------------------------------------------------------------

/// Buffers raw bytes from a streaming body and yields the payload of every
/// complete `data:` line.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters split
/// across network chunks decode correctly. Comment lines, `event:`/`id:`
/// fields and blank separators are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the data payloads it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
        }

        payloads
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
