//! Scripted delta source that replays canned SSE payloads through the real
//! stream parser. Used by the unit and integration tests.

use super::stream::delta_stream;
use super::{ChatRequest, DeltaSource, DeltaStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// What the next `open_stream` call produces.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Payloads delivered in order, then the body closes.
    Chunks(Vec<String>),
    /// Payloads delivered, then the body never yields again.
    Stall(Vec<String>),
    /// Payloads delivered, then a transport error.
    Fail(Vec<String>, String),
    /// `open_stream` itself fails.
    RefuseOpen(String),
}

#[derive(Clone, Default)]
pub struct MockStreamSource {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockStreamSource {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every request seen so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl DeltaSource for MockStreamSource {
    async fn open_stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        self.requests.lock().push(request.clone());
        let next = self.responses.lock().pop_front();

        let Some(response) = next else {
            return Err(Error::Transport(
                "MockStreamSource: no more responses configured".to_string(),
            ));
        };

        let bytes = match response {
            MockResponse::Chunks(payloads) => stream::iter(framed(payloads)).boxed(),
            MockResponse::Stall(payloads) => stream::iter(framed(payloads))
                .chain(stream::pending())
                .boxed(),
            MockResponse::Fail(payloads, message) => stream::iter(framed(payloads))
                .chain(stream::once(async move { Err(Error::Transport(message)) }))
                .boxed(),
            MockResponse::RefuseOpen(message) => return Err(Error::Transport(message)),
        };

        Ok(delta_stream(bytes))
    }
}

fn framed(payloads: Vec<String>) -> Vec<Result<Bytes>> {
    payloads
        .into_iter()
        .map(|payload| {
            let framed = if payload.starts_with("data:") {
                payload
            } else {
                format!("data: {payload}")
            };
            let framed = if framed.ends_with("\n\n") {
                framed
            } else {
                format!("{framed}\n\n")
            };
            Ok(Bytes::from(framed))
        })
        .collect()
}

fn chunk(delta: Value, finish_reason: Option<&str>) -> String {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
    })
    .to_string()
}

pub fn role_chunk() -> String {
    chunk(json!({ "role": "assistant" }), None)
}

pub fn content_chunk(text: &str) -> String {
    chunk(json!({ "content": text }), None)
}

/// One tool-call fragment. Empty `id` or `name` are left out, the way
/// continuation fragments arrive on the wire.
pub fn tool_call_chunk(index: u32, id: &str, name: &str, arguments: &str) -> String {
    let mut function = Map::new();
    if !name.is_empty() {
        function.insert("name".to_string(), json!(name));
    }
    function.insert("arguments".to_string(), json!(arguments));

    let mut call = Map::new();
    call.insert("index".to_string(), json!(index));
    if !id.is_empty() {
        call.insert("id".to_string(), json!(id));
        call.insert("type".to_string(), json!("function"));
    }
    call.insert("function".to_string(), Value::Object(function));

    chunk(json!({ "tool_calls": [Value::Object(call)] }), None)
}

pub fn finish_chunk(reason: &str) -> String {
    chunk(json!({}), Some(reason))
}

pub fn done_chunk() -> String {
    "[DONE]".to_string()
}

/// A complete text turn: role, one chunk per piece, stop marker.
pub fn text_round(pieces: &[&str]) -> MockResponse {
    let mut payloads = vec![role_chunk()];
    payloads.extend(pieces.iter().map(|piece| content_chunk(piece)));
    payloads.push(finish_chunk("stop"));
    payloads.push(done_chunk());
    MockResponse::Chunks(payloads)
}

/// A complete tool-call turn issuing each `(id, name, arguments)` in order.
pub fn tool_round(calls: &[(&str, &str, &str)]) -> MockResponse {
    let mut payloads = vec![role_chunk()];
    for (index, (id, name, arguments)) in calls.iter().enumerate() {
        payloads.push(tool_call_chunk(index as u32, id, name, arguments));
    }
    payloads.push(finish_chunk("tool_calls"));
    payloads.push(done_chunk());
    MockResponse::Chunks(payloads)
}
