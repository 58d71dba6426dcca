use super::logging::emit_sse_parse_error;
use super::{DeltaStream, FinishReason, StreamDelta, ToolCallFragment};
use crate::error::Result;
use crate::types::{ChatChunk, Role};
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

const DONE_SENTINEL: &str = "[DONE]";

/// Incremental parser for chat-completions server-sent events.
///
/// Bytes are buffered until a blank line closes an event, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
    saw_done: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` sentinel has been read.
    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    pub fn process(&mut self, chunk: &[u8]) -> Vec<StreamDelta> {
        self.buffer.extend_from_slice(chunk);
        let mut deltas = Vec::new();

        while let Some((end, delimiter_len)) = find_event_end(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end + delimiter_len).collect();
            let text = String::from_utf8_lossy(&event[..end]);
            if let Some(delta) = self.parse_event(&text) {
                deltas.push(delta);
            }
        }

        deltas
    }

    /// Parse whatever is left once the body has closed.
    pub fn finish(&mut self) -> Vec<StreamDelta> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return Vec::new();
        }
        self.buffer.extend_from_slice(b"\n\n");
        self.process(&[])
    }

    fn parse_event(&mut self, event_text: &str) -> Option<StreamDelta> {
        let mut event_type = None;
        let mut data_lines = Vec::new();

        for line in event_text.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("event:") {
                event_type = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim());
            }
        }

        let data = data_lines.join("\n");
        if data.is_empty() {
            return None;
        }
        if data == DONE_SENTINEL {
            self.saw_done = true;
            return None;
        }

        match serde_json::from_str::<ChatChunk>(&data) {
            Ok(chunk) => delta_from_chunk(chunk),
            Err(error) => {
                emit_sse_parse_error(event_type.as_deref(), &data, &error);
                None
            }
        }
    }
}

fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| (pos, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Reduce a wire chunk to the first choice's delta. Chunks without choices
/// (usage reports) produce nothing.
fn delta_from_chunk(chunk: ChatChunk) -> Option<StreamDelta> {
    let choice = chunk
        .choices
        .into_iter()
        .min_by_key(|choice| choice.index)?;

    let tool_calls = choice
        .delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let function = call.function.unwrap_or_default();
            ToolCallFragment {
                index: call.index,
                id: call.id.unwrap_or_default(),
                name: function.name.unwrap_or_default(),
                arguments: function.arguments.unwrap_or_default(),
            }
        })
        .collect();

    Some(StreamDelta {
        role: choice.delta.role.as_deref().and_then(Role::parse),
        content: choice.delta.content.filter(|text| !text.is_empty()),
        tool_calls,
        finish_reason: choice
            .finish_reason
            .as_deref()
            .filter(|reason| !reason.is_empty())
            .map(FinishReason::parse),
    })
}

struct DeltaState {
    bytes: ByteStream,
    parser: StreamParser,
    queue: VecDeque<StreamDelta>,
    finished: bool,
}

/// Turn a raw SSE body into a stream of deltas. A transport error is
/// yielded once and ends the stream.
pub fn delta_stream(bytes: ByteStream) -> DeltaStream {
    let state = DeltaState {
        bytes,
        parser: StreamParser::new(),
        queue: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.queue.pop_front() {
                return Some((Ok(delta), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let deltas = state.parser.process(&chunk);
                    state.queue.extend(deltas);
                }
                Some(Err(error)) => {
                    state.finished = true;
                    state.queue.clear();
                    return Some((Err(error), state));
                }
                None => {
                    state.finished = true;
                    let deltas = state.parser.finish();
                    state.queue.extend(deltas);
                }
            }
        }
    }))
}
