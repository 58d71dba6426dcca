use crate::api::{DeltaStream, FinishReason, StreamDelta, ToolCallFragment};
use crate::error::{Error, Result};
use crate::sink::EventSink;
use crate::types::{ResponseEvent, Role, ToolCallRequest};
use futures::StreamExt;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    Undetermined,
    Text,
    ToolCalls,
}

/// What a finished stream turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembledTurn {
    Text(String),
    ToolCalls(Vec<ToolCallRequest>),
}

#[derive(Debug, Default)]
struct CallAccumulator {
    name: String,
    arguments: String,
}

/// Folds one stream of deltas into a finished turn, delivering cumulative
/// text to the sink as it arrives.
///
/// The assembler never emits `ToolCallReady` on its own; the session calls
/// [`TurnAssembler::announce_tool_calls`] once the calls are registered.
pub struct TurnAssembler {
    mode: TurnMode,
    role: Role,
    content: String,
    calls: IndexMap<String, CallAccumulator>,
    ids_by_index: HashMap<u32, String>,
    last_id: Option<String>,
    started: Instant,
    sink: Option<Arc<dyn EventSink>>,
}

impl TurnAssembler {
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            mode: TurnMode::Undetermined,
            role: Role::Assistant,
            content: String::new(),
            calls: IndexMap::new(),
            ids_by_index: HashMap::new(),
            last_id: None,
            started: Instant::now(),
            sink,
        }
    }

    pub fn mode(&self) -> TurnMode {
        self.mode
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Receives until a finish marker, checking `cancel` before every receive.
    pub async fn run(
        &mut self,
        mut stream: DeltaStream,
        cancel: &CancellationToken,
    ) -> Result<AssembledTurn> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = stream.next() => next,
            };
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match next {
                Some(Ok(delta)) => {
                    if let Some(turn) = self.apply(delta)? {
                        return Ok(turn);
                    }
                }
                Some(Err(error)) => return Err(error),
                None => return Err(Error::MissingFinishMarker),
            }
        }
    }

    /// Folds one delta. Returns the finished turn once a finish marker arrives.
    pub fn apply(&mut self, delta: StreamDelta) -> Result<Option<AssembledTurn>> {
        if let Some(role) = delta.role {
            self.role = role;
        }

        if !delta.tool_calls.is_empty() {
            if self.mode != TurnMode::ToolCalls && !self.content.is_empty() {
                tracing::debug!(
                    discarded_chars = self.content.len(),
                    "turn switched to tool calls; dropping streamed text"
                );
            }
            self.mode = TurnMode::ToolCalls;
            for fragment in delta.tool_calls {
                self.accumulate(fragment);
            }
        }

        if let Some(text) = delta.content {
            match self.mode {
                TurnMode::ToolCalls => {}
                TurnMode::Undetermined | TurnMode::Text => {
                    self.mode = TurnMode::Text;
                    self.content.push_str(&text);
                    self.deliver(ResponseEvent::TextDelta {
                        role: self.role,
                        content: self.content.clone(),
                        elapsed_ms: self.elapsed_ms(),
                    });
                }
            }
        }

        match delta.finish_reason {
            None => Ok(None),
            Some(reason) => self.finalize(reason).map(Some),
        }
    }

    /// Delivers one `ToolCallReady` per call, in order.
    pub fn announce_tool_calls(&self, calls: &[ToolCallRequest]) {
        let elapsed_ms = self.elapsed_ms();
        for call in calls {
            self.deliver(ResponseEvent::ToolCallReady {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
                elapsed_ms,
            });
        }
    }

    fn accumulate(&mut self, fragment: ToolCallFragment) {
        let id = if fragment.id.is_empty() {
            let known = fragment
                .index
                .and_then(|index| self.ids_by_index.get(&index).cloned())
                .or_else(|| self.last_id.clone());
            match known {
                Some(id) => id,
                None => {
                    tracing::warn!(
                        index = ?fragment.index,
                        "dropping tool-call fragment with no id to attach to"
                    );
                    return;
                }
            }
        } else {
            fragment.id
        };

        if let Some(index) = fragment.index {
            self.ids_by_index.insert(index, id.clone());
        }
        self.last_id = Some(id.clone());

        let call = self.calls.entry(id).or_default();
        if call.name.is_empty() && !fragment.name.is_empty() {
            call.name = fragment.name;
        }
        call.arguments.push_str(&fragment.arguments);
    }

    fn finalize(&mut self, reason: FinishReason) -> Result<AssembledTurn> {
        match (self.mode, reason) {
            (TurnMode::ToolCalls, FinishReason::ToolCalls) => Ok(AssembledTurn::ToolCalls(
                self.calls.drain(..).map(finalize_call).collect(),
            )),
            (TurnMode::ToolCalls, other) => Err(Error::UnexpectedFinish {
                reason: other.as_str().to_string(),
            }),
            (_, FinishReason::Stop) => Ok(AssembledTurn::Text(std::mem::take(&mut self.content))),
            (_, FinishReason::ToolCalls) => {
                tracing::warn!("tool_calls finish marker without any tool calls; treating as text");
                Ok(AssembledTurn::Text(std::mem::take(&mut self.content)))
            }
            (_, FinishReason::Other(reason)) => {
                tracing::warn!(reason = %reason, "stream finished early; keeping partial text");
                Ok(AssembledTurn::Text(std::mem::take(&mut self.content)))
            }
        }
    }

    fn deliver(&self, event: ResponseEvent) {
        if let Some(sink) = &self.sink {
            sink.deliver(event);
        }
    }
}

fn finalize_call((id, call): (String, CallAccumulator)) -> ToolCallRequest {
    let arguments = if call.arguments.trim().is_empty() {
        "{}".to_string()
    } else {
        if serde_json::from_str::<serde_json::Value>(&call.arguments).is_err() {
            tracing::warn!(
                tool_call_id = %id,
                name = %call.name,
                "tool-call arguments are not valid JSON; passing them through unchanged"
            );
        }
        call.arguments
    };
    if call.name.is_empty() {
        tracing::warn!(tool_call_id = %id, "tool call finished without a function name");
    }
    ToolCallRequest::function(id, call.name, arguments)
}
