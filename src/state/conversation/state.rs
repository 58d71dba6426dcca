use super::super::{MessageLog, PendingCalls};
use crate::api::{ChatClient, DeltaSource};
use crate::config::Config;
use crate::error::Result;
use crate::sink::EventSink;
use crate::tools::{tool_definitions, ToolDefinition};
use crate::types::{Entry, Role, ToolCallRequest};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    AwaitingToolResults,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    /// Upper bound on non-system entries sent upstream per request.
    pub max_context_entries: usize,
    /// Consecutive follow-up streams allowed before the session stops
    /// opening new ones. Reset by every user turn.
    pub max_followup_rounds: usize,
    pub history_path: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            system_prompt: None,
            temperature: 0.7,
            max_context_entries: 64,
            max_followup_rounds: 24,
            history_path: None,
        }
    }
}

/// How a submission ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model answered with text, now committed to the log.
    Text(String),
    /// The model asked for tools; each id is pending until a result arrives.
    ToolCalls(Vec<ToolCallRequest>),
    /// The result was recorded but other calls from the batch are still open.
    AwaitingResults { remaining: usize },
    /// The result was recorded; no sink is attached so no follow-up was opened.
    Detached,
    /// The result was recorded while the session was not waiting on tool
    /// results, so no follow-up was opened.
    Recorded,
    /// The result answered no pending call and was dropped.
    Ignored,
}

/// Cancellation handle, sink and state for the stream in flight.
pub(super) struct ActiveTurn {
    pub(super) generation: u64,
    pub(super) cancel: Option<CancellationToken>,
    pub(super) sink: Option<Arc<dyn EventSink>>,
    pub(super) state: SessionState,
    pub(super) followup_rounds: usize,
}

/// One conversation with a chat-completions upstream.
///
/// All methods take `&self`; share the session in an `Arc` to cancel from
/// another task while a submission is awaiting its stream.
pub struct Session {
    pub(super) id: String,
    pub(super) source: Arc<dyn DeltaSource>,
    pub(super) options: SessionOptions,
    pub(super) tools: Vec<ToolDefinition>,
    // Lock order: `log` before `active`. Neither is held across an await.
    pub(super) log: Mutex<MessageLog>,
    pub(super) active: Mutex<ActiveTurn>,
    pub(super) pending: PendingCalls,
}

impl Session {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let client = ChatClient::new(config)?;
        Ok(Self::with_source(Arc::new(client), config.session_options()))
    }

    pub fn with_source(source: Arc<dyn DeltaSource>, options: SessionOptions) -> Self {
        let log = MessageLog::with_system_prompt(options.system_prompt.as_deref());
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(session_id = %id, model = %options.model, "session created");

        Self {
            id,
            source,
            options,
            tools: tool_definitions(),
            log: Mutex::new(log),
            active: Mutex::new(ActiveTurn {
                generation: 0,
                cancel: None,
                sink: None,
                state: SessionState::Idle,
                followup_rounds: 0,
            }),
            pending: PendingCalls::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.active.lock().state
    }

    pub fn history(&self) -> Vec<Entry> {
        self.log.lock().entries().to_vec()
    }

    pub fn pending_calls(&self) -> Vec<String> {
        self.pending.snapshot()
    }

    pub fn last_assistant_message(&self) -> Option<String> {
        self.log.lock().last_assistant_text().map(str::to_string)
    }

    pub fn add_system_message(&self, content: impl Into<String>) {
        let content = content.into();
        if content.contains("DEBUG:") {
            tracing::debug!("not recording debug system message");
            return;
        }
        self.log.lock().push(Entry::system(content));
    }

    /// Empties the log back to the system prompt and forgets pending calls.
    pub fn clear_history(&self) -> Result<()> {
        {
            let mut log = self.log.lock();
            *log = MessageLog::with_system_prompt(self.options.system_prompt.as_deref());
            let dropped = self.pending.drain_all();
            if !dropped.is_empty() {
                tracing::debug!(count = dropped.len(), "dropped pending calls with cleared history");
            }
        }
        match &self.options.history_path {
            Some(path) => self.save_history(path),
            None => Ok(()),
        }
    }

    pub fn save_history(&self, path: &Path) -> Result<()> {
        let snapshot = self.log.lock().clone();
        snapshot.save(path)?;
        tracing::debug!(path = %path.display(), entries = snapshot.len(), "history saved");
        Ok(())
    }

    /// Replaces the log with a saved one. Tool calls left unanswered in the
    /// loaded log become pending and the session waits on their results;
    /// the next user turn reconciles whatever is still open.
    pub fn load_history(&self, path: &Path) -> Result<()> {
        let loaded = MessageLog::load(path)?;
        let mut log = self.log.lock();
        self.pending.drain_all();
        for id in unanswered_call_ids(loaded.entries()) {
            self.pending.register(&id);
        }
        tracing::debug!(
            path = %path.display(),
            entries = loaded.len(),
            pending = self.pending.len(),
            "history loaded"
        );
        *log = loaded;

        let mut active = self.active.lock();
        if active.cancel.is_none() {
            active.state = if self.pending.is_empty() {
                SessionState::Idle
            } else {
                SessionState::AwaitingToolResults
            };
        }
        Ok(())
    }

    /// Cancels any active stream and saves to the configured history path.
    pub fn close(&self) -> Result<()> {
        self.cancel();
        match &self.options.history_path {
            Some(path) => self.save_history(path),
            None => Ok(()),
        }
    }
}

fn unanswered_call_ids(entries: &[Entry]) -> Vec<String> {
    let answered: HashSet<&str> = entries
        .iter()
        .filter(|entry| entry.role == Role::Tool)
        .filter_map(|entry| entry.tool_call_id.as_deref())
        .collect();
    entries
        .iter()
        .filter(|entry| entry.issues_tool_calls())
        .flat_map(|entry| entry.tool_calls.iter())
        .filter(|call| !answered.contains(call.id.as_str()))
        .map(|call| call.id.clone())
        .collect()
}
