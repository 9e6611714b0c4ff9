//! Server-sent-event decoding.
//!
//! Turns an arbitrary sequence of byte chunks into ordered event records.
//! Lines are split on raw bytes, so a chunk boundary that falls inside a
//! multi-byte UTF-8 sequence is carried over untouched until the line ends.
//! The decoder knows nothing about payload semantics.

use std::collections::VecDeque;

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;

/// Payload value that ends the stream successfully.
pub const DONE_SENTINEL: &str = "[DONE]";

// ─── Records ─────────────────────────────────────────────────────────────────

/// One decoded event record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    /// Consecutive `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Item yielded by [`decode_sse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Event(SseEvent),
    /// The `[DONE]` sentinel was seen; nothing follows.
    Done,
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// Incremental SSE decoder with a carry-over buffer across chunk boundaries.
///
/// One decoder per stream session; feed it chunks as they arrive and call
/// [`SseDecoder::finish`] at end of input.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes of the current, not yet terminated line.
    line: Vec<u8>,
    /// The previous byte was `\r`; a following `\n` belongs to the same terminator.
    skip_lf: bool,
    pending: SseEvent,
    has_data: bool,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[DONE]` has been decoded. Further input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one chunk, returning every record completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();

        for &byte in chunk {
            if self.done {
                break;
            }
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut events),
                b'\r' => {
                    self.skip_lf = true;
                    self.end_line(&mut events);
                }
                _ => self.line.push(byte),
            }
        }

        events
    }

    /// Flush at end of input.
    ///
    /// An unterminated last line is processed, and a record still missing its
    /// blank-line terminator is dispatched rather than dropped.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.done {
            return None;
        }
        let mut events = Vec::new();
        if !self.line.is_empty() {
            self.end_line(&mut events);
        }
        self.dispatch(&mut events);
        events.pop()
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        let line = std::mem::take(&mut self.line);
        self.process_line(&line, events);
    }

    fn process_line(&mut self, line: &[u8], events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line[0] == b':' {
            return;
        }

        let text = String::from_utf8_lossy(line);
        let Some((field, value)) = text.split_once(':') else {
            tracing::trace!(line = %text, "skipping SSE line without field separator");
            return;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);

        match field {
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.pending.event = Some(value.to_string()),
            "id" => self.pending.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse() {
                    self.pending.retry = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        let event = std::mem::take(&mut self.pending);
        if !std::mem::take(&mut self.has_data) {
            return;
        }
        if event.data.trim() == DONE_SENTINEL {
            self.done = true;
            self.line.clear();
            return;
        }
        events.push(event);
    }
}

// ─── Stream adapter ──────────────────────────────────────────────────────────

/// Decode a byte stream into SSE frames.
///
/// Yields every record in order, then [`SseFrame::Done`] if the sentinel was
/// seen. A transport error is yielded once and ends the sequence.
pub fn decode_sse<S, B>(byte_stream: S) -> impl Stream<Item = Result<SseFrame, InferenceError>>
where
    S: Stream<Item = Result<B, InferenceError>> + Unpin,
    B: AsRef<[u8]>,
{
    let state = DecodeState {
        byte_stream,
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        exhausted: false,
        done_emitted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(SseFrame::Event(event)), state));
            }
            if state.decoder.is_done() {
                if state.done_emitted {
                    return None;
                }
                state.done_emitted = true;
                return Some((Ok(SseFrame::Done), state));
            }
            if state.exhausted {
                return None;
            }

            match state.byte_stream.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.feed(bytes.as_ref());
                    state.ready.extend(events);
                }
                Some(Err(e)) => {
                    state.exhausted = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.exhausted = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
}

struct DecodeState<S> {
    byte_stream: S,
    decoder: SseDecoder,
    ready: VecDeque<SseEvent>,
    exhausted: bool,
    done_emitted: bool,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
