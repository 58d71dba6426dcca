use super::entry::Role;
use serde::{Deserialize, Serialize};

/// Live event delivered to the caller's sink while a turn is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    /// Cumulative assistant text for the current turn.
    #[serde(rename = "message")]
    TextDelta {
        role: Role,
        content: String,
        elapsed_ms: u64,
    },
    /// A finalized tool call, already registered as pending.
    #[serde(rename = "function_call")]
    ToolCallReady {
        id: String,
        name: String,
        arguments: String,
        elapsed_ms: u64,
    },
    /// A text turn started by a user submission finished.
    TurnComplete,
    /// A follow-up turn (after tool results) finished with text.
    FollowupComplete,
}

impl ResponseEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseEvent::TextDelta { .. } => "message",
            ResponseEvent::ToolCallReady { .. } => "function_call",
            ResponseEvent::TurnComplete => "turn_complete",
            ResponseEvent::FollowupComplete => "followup_complete",
        }
    }
}
