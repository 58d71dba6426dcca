use super::history::project_history;
use super::state::{Session, SessionState, TurnOutcome};
use super::streaming::{AssembledTurn, TurnAssembler};
use crate::api::ChatRequest;
use crate::error::{Error, Result};
use crate::sink::EventSink;
use crate::state::MessageLog;
use crate::types::{Entry, ResponseEvent};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CANCELLED_TOOL_RESULT: &str = "execution cancelled by user";

/// The stream a submission owns.
struct TurnTicket {
    generation: u64,
    cancel: CancellationToken,
    sink: Option<Arc<dyn EventSink>>,
    followup: bool,
}

impl Session {
    /// Starts a new user turn, cancelling whatever is in flight.
    ///
    /// Calls still pending from an earlier turn are answered with a
    /// cancellation error ahead of the new entries.
    pub async fn submit_user_turn(
        &self,
        entries: Vec<Entry>,
        sink: Arc<dyn EventSink>,
    ) -> Result<TurnOutcome> {
        let ticket = {
            let mut active = self.active.lock();
            if let Some(previous) = active.cancel.take() {
                tracing::debug!(session_id = %self.id, "cancelling in-flight stream for new user turn");
                previous.cancel();
            }
            active.generation += 1;
            active.followup_rounds = 0;
            active.sink = Some(sink);
            let cancel = CancellationToken::new();
            active.cancel = Some(cancel.clone());
            active.state = SessionState::Streaming;
            TurnTicket {
                generation: active.generation,
                cancel,
                sink: active.sink.clone(),
                followup: false,
            }
        };

        let request = {
            let mut log = self.log.lock();
            // Drained under the log lock so a tool-call commit racing with
            // this turn is either fully visible here or rejected as stale.
            let drained = self.pending.drain_all();
            if !drained.is_empty() {
                tracing::debug!(
                    session_id = %self.id,
                    count = drained.len(),
                    "answering abandoned tool calls with cancellation results"
                );
            }
            for id in drained {
                let name = tool_name_for(log.entries(), &id);
                let content = json!({ "error": CANCELLED_TOOL_RESULT }).to_string();
                log.push(Entry::tool_result(id, name, content));
            }
            log.extend(entries);
            self.build_request(&log)
        };

        self.stream_turn(ticket, request).await
    }

    /// Records a tool result and, once no calls from the batch remain open,
    /// streams the follow-up turn.
    pub async fn submit_tool_result(
        &self,
        tool_call_id: &str,
        name: &str,
        output: &str,
        success: bool,
    ) -> Result<TurnOutcome> {
        let content = if success {
            json!({ "output": output })
        } else {
            json!({ "error": output })
        }
        .to_string();

        let remaining = {
            let mut log = self.log.lock();
            if !self.pending.resolve(tool_call_id) {
                if log.has_tool_result(tool_call_id) {
                    tracing::warn!(
                        session_id = %self.id,
                        tool_call_id,
                        "ignoring result for a tool call that is already answered"
                    );
                } else {
                    tracing::warn!(
                        session_id = %self.id,
                        tool_call_id,
                        "ignoring result for a tool call that was never issued"
                    );
                }
                return Ok(TurnOutcome::Ignored);
            }
            let name = (!name.is_empty()).then(|| name.to_string());
            log.push(Entry::tool_result(tool_call_id, name, content));
            self.pending.len()
        };

        if remaining > 0 {
            tracing::debug!(session_id = %self.id, remaining, "waiting for remaining tool results");
            return Ok(TurnOutcome::AwaitingResults { remaining });
        }

        let ticket = {
            let mut active = self.active.lock();
            // Only a session parked on tool results may open a follow-up;
            // a live stream belongs to a newer turn and keeps running.
            if active.state != SessionState::AwaitingToolResults {
                tracing::debug!(
                    session_id = %self.id,
                    state = ?active.state,
                    "result recorded outside a tool round; not opening a follow-up"
                );
                return Ok(TurnOutcome::Recorded);
            }
            let Some(sink) = active.sink.clone() else {
                active.state = SessionState::Idle;
                tracing::debug!(session_id = %self.id, "no sink attached; not opening a follow-up");
                return Ok(TurnOutcome::Detached);
            };
            if active.followup_rounds >= self.options.max_followup_rounds {
                active.state = SessionState::Idle;
                tracing::warn!(
                    session_id = %self.id,
                    limit = self.options.max_followup_rounds,
                    "follow-up limit reached"
                );
                return Err(Error::FollowupLimit(self.options.max_followup_rounds));
            }
            active.followup_rounds += 1;
            if let Some(previous) = active.cancel.take() {
                previous.cancel();
            }
            active.generation += 1;
            let cancel = CancellationToken::new();
            active.cancel = Some(cancel.clone());
            active.state = SessionState::Streaming;
            TurnTicket {
                generation: active.generation,
                cancel,
                sink: Some(sink),
                followup: true,
            }
        };

        let request = {
            let log = self.log.lock();
            self.build_request(&log)
        };
        self.stream_turn(ticket, request).await
    }

    /// Cancels the active stream, if any. Pending calls are left alone.
    pub fn cancel(&self) {
        let mut active = self.active.lock();
        if let Some(token) = active.cancel.take() {
            tracing::debug!(session_id = %self.id, "cancelling active stream");
            token.cancel();
            active.state = SessionState::Cancelled;
        }
    }

    /// Detaches the sink and cancels the active stream.
    pub fn finalize_interaction(&self) {
        let mut active = self.active.lock();
        active.sink = None;
        if let Some(token) = active.cancel.take() {
            token.cancel();
            active.state = SessionState::Cancelled;
        }
    }

    fn build_request(&self, log: &MessageLog) -> ChatRequest {
        let window = log.context_window(self.options.max_context_entries);
        ChatRequest {
            model: self.options.model.clone(),
            messages: project_history(&window),
            tools: self.tools.clone(),
            temperature: self.options.temperature,
        }
    }

    async fn stream_turn(&self, ticket: TurnTicket, request: ChatRequest) -> Result<TurnOutcome> {
        tracing::debug!(
            session_id = %self.id,
            generation = ticket.generation,
            followup = ticket.followup,
            messages = request.messages.len(),
            "opening stream"
        );

        let opened = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => Err(Error::Cancelled),
            opened = self.source.open_stream(&request) => opened,
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(error) => return Err(self.fail_turn(&ticket, error)),
        };

        let mut assembler = TurnAssembler::new(ticket.sink.clone());
        let turn = match assembler.run(stream, &ticket.cancel).await {
            Ok(turn) => turn,
            Err(error) => return Err(self.fail_turn(&ticket, error)),
        };

        match turn {
            AssembledTurn::Text(content) => {
                {
                    let mut log = self.log.lock();
                    if !self.is_current(&ticket) {
                        return Err(Error::Cancelled);
                    }
                    if content.is_empty() {
                        tracing::debug!(session_id = %self.id, "turn finished without text; nothing to commit");
                    } else {
                        log.push(Entry::assistant(content.clone()));
                    }
                }
                self.finish_turn(&ticket, SessionState::Idle);
                let completion = if ticket.followup {
                    ResponseEvent::FollowupComplete
                } else {
                    ResponseEvent::TurnComplete
                };
                if let Some(sink) = &ticket.sink {
                    sink.deliver(completion);
                }
                Ok(TurnOutcome::Text(content))
            }
            AssembledTurn::ToolCalls(calls) => {
                {
                    let mut log = self.log.lock();
                    if !self.is_current(&ticket) {
                        return Err(Error::Cancelled);
                    }
                    for call in &calls {
                        if !self.pending.register(&call.id) {
                            tracing::warn!(
                                session_id = %self.id,
                                tool_call_id = %call.id,
                                "tool call id reused while still pending"
                            );
                        }
                    }
                    log.push(Entry::assistant_tool_calls(calls.clone()));
                }
                self.finish_turn(&ticket, SessionState::AwaitingToolResults);
                tracing::debug!(session_id = %self.id, count = calls.len(), "tool calls issued");
                assembler.announce_tool_calls(&calls);
                Ok(TurnOutcome::ToolCalls(calls))
            }
        }
    }

    /// True while the ticket's stream is the session's active one and has
    /// not been cancelled. Takes the `active` lock; call with `log` held.
    fn is_current(&self, ticket: &TurnTicket) -> bool {
        self.active.lock().generation == ticket.generation && !ticket.cancel.is_cancelled()
    }

    fn finish_turn(&self, ticket: &TurnTicket, state: SessionState) {
        let mut active = self.active.lock();
        if active.generation == ticket.generation {
            active.state = state;
            active.cancel = None;
        }
    }

    fn fail_turn(&self, ticket: &TurnTicket, error: Error) -> Error {
        match &error {
            Error::Cancelled => {
                tracing::debug!(session_id = %self.id, generation = ticket.generation, "turn cancelled");
                self.finish_turn(ticket, SessionState::Cancelled);
            }
            other => {
                tracing::warn!(session_id = %self.id, error = %other, "turn failed");
                self.finish_turn(ticket, SessionState::Idle);
            }
        }
        error
    }
}

fn tool_name_for(entries: &[Entry], id: &str) -> Option<String> {
    entries
        .iter()
        .rev()
        .flat_map(|entry| entry.tool_calls.iter())
        .find(|call| call.id == id)
        .map(|call| call.function.name.clone())
}
