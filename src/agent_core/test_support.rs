//! Shared fixtures for agent_core tests: a scripted transport, SSE payload
//! builders and a recording observer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::inference::delta::Delta;
use crate::inference::errors::InferenceError;
use crate::inference::transport::{ByteStream, ChatTransport};
use crate::inference::types::ChatCompletionRequest;

use super::observer::{StreamObserver, StreamUpdate};
use super::state::{StreamStatus, TurnOutcome};

// ─── Payload builders ───────────────────────────────────────────────────────

pub(crate) fn text_chunk(text: &str) -> String {
    json!({"choices": [{"index": 0, "delta": {"content": text}}]}).to_string()
}

pub(crate) fn finish_chunk(reason: &str) -> String {
    json!({"choices": [{"index": 0, "delta": {}, "finish_reason": reason}]}).to_string()
}

pub(crate) fn usage_chunk(prompt: u32, completion: u32) -> String {
    json!({
        "choices": [],
        "usage": {"prompt_tokens": prompt, "completion_tokens": completion}
    })
    .to_string()
}

pub(crate) fn tool_call_chunk(
    index: u32,
    id: Option<&str>,
    name: Option<&str>,
    arguments: &str,
) -> String {
    let mut function = json!({"arguments": arguments});
    if let Some(name) = name {
        function["name"] = json!(name);
    }
    let mut call = json!({"index": index, "function": function});
    if let Some(id) = id {
        call["id"] = json!(id);
        call["type"] = json!("function");
    }
    json!({"choices": [{"index": 0, "delta": {"tool_calls": [call]}}]}).to_string()
}

/// Full SSE body: one `data:` record per payload, then the sentinel.
pub(crate) fn sse_body(payloads: &[&str]) -> String {
    let mut body = String::new();
    for payload in payloads {
        body.push_str("data: ");
        body.push_str(payload);
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

// ─── Scripted transport ─────────────────────────────────────────────────────

/// What one `open_stream` call does.
pub(crate) enum Script {
    /// `open_stream` itself fails.
    Fail(InferenceError),
    /// Body delivered as these chunks, then EOF.
    Chunks(Vec<Vec<u8>>),
    /// Body delivered as these chunks, then a read error.
    ChunksThenFail(Vec<Vec<u8>>, InferenceError),
    /// Body chunks pushed by the test through a [`Feed`].
    Feed(mpsc::UnboundedReceiver<Result<Bytes, InferenceError>>),
    /// The body never produces anything.
    Stall,
    /// `open_stream` panics.
    Panic,
}

impl Script {
    pub(crate) fn body(body: String) -> Self {
        Script::Chunks(vec![body.into_bytes()])
    }

    pub(crate) fn then_fail(self, error: InferenceError) -> Self {
        match self {
            Script::Chunks(chunks) => Script::ChunksThenFail(chunks, error),
            other => other,
        }
    }
}

/// Test-side sender for a [`Script::Feed`] body.
pub(crate) struct Feed {
    tx: mpsc::UnboundedSender<Result<Bytes, InferenceError>>,
}

impl Feed {
    pub(crate) fn send_raw(&self, raw: &str) {
        let _ = self.tx.send(Ok(Bytes::from(raw.to_string())));
    }

    pub(crate) fn send_event(&self, payload: &str) {
        self.send_raw(&format!("data: {payload}\n\n"));
    }
}

/// Transport that replays one [`Script`] per `open_stream` call and records
/// every request body it was given.
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(scripts: Vec<Script>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Single-attempt transport whose body is pushed by the test.
    pub(crate) fn with_feed() -> (std::sync::Arc<Self>, Feed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(vec![Script::Feed(rx)]), Feed { tx })
    }

    pub(crate) fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn chunk_stream(chunks: Vec<Vec<u8>>) -> impl futures::Stream<Item = Result<Bytes, InferenceError>> {
    stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open_stream(&self, body: &ChatCompletionRequest) -> Result<ByteStream, InferenceError> {
        self.requests.lock().unwrap().push(body.clone());
        let script = self.scripts.lock().unwrap().pop_front();

        match script {
            None => Err(InferenceError::Transport {
                endpoint: "scripted".into(),
                reason: "no scripted response left".into(),
            }),
            Some(Script::Fail(e)) => Err(e),
            Some(Script::Chunks(chunks)) => Ok(Box::pin(chunk_stream(chunks))),
            Some(Script::ChunksThenFail(chunks, e)) => {
                Ok(Box::pin(chunk_stream(chunks).chain(stream::iter([Err(e)]))))
            }
            Some(Script::Feed(rx)) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))),
            Some(Script::Stall) => Ok(Box::pin(stream::pending::<Result<Bytes, InferenceError>>())),
            Some(Script::Panic) => panic!("scripted transport panic"),
        }
    }

    fn endpoint(&self) -> &str {
        "scripted"
    }
}

// ─── Recording observer ─────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct RecordingObserver {
    deltas: Mutex<Vec<(usize, Delta)>>,
    outcomes: Mutex<Vec<TurnOutcome>>,
}

impl RecordingObserver {
    pub(crate) fn delta_count(&self) -> usize {
        self.deltas.lock().unwrap().len()
    }

    /// Rounds in which each delta arrived, in order.
    pub(crate) fn delta_rounds(&self) -> Vec<usize> {
        self.deltas.lock().unwrap().iter().map(|(r, _)| *r).collect()
    }

    /// Concatenated text deltas across all rounds.
    pub(crate) fn text(&self) -> String {
        self.deltas
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, d)| match d {
                Delta::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn terminals(&self) -> Vec<StreamStatus> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .map(TurnOutcome::status)
            .collect()
    }

    pub(crate) fn outcomes(&self) -> Vec<TurnOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    async fn wait_until(&self, what: &str, done: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done(self) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub(crate) async fn wait_for_deltas(&self, count: usize) {
        self.wait_until("deltas", |o| o.delta_count() >= count).await;
    }

    pub(crate) async fn wait_for_terminal(&self) {
        self.wait_until("terminal signal", |o| !o.terminals().is_empty())
            .await;
    }
}

impl StreamObserver for RecordingObserver {
    fn on_delta(&self, update: &StreamUpdate<'_>) {
        self.deltas
            .lock()
            .unwrap()
            .push((update.round, update.delta.clone()));
    }

    fn on_terminal(&self, _turn_id: &str, outcome: &TurnOutcome) {
        self.outcomes.lock().unwrap().push(outcome.clone());
    }
}
