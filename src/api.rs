pub mod client;
pub mod logging;
pub mod mock_client;
pub mod stream;

use crate::error::Result;
use crate::tools::ToolDefinition;
use crate::types::{Entry, Role};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

pub use client::ChatClient;

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// Everything the upstream needs for one turn. `messages` is already
/// projected and safe to send as-is.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Entry>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
}

/// Opens one streamed completion per call. Implemented by the HTTP client
/// and by the scripted mock used in tests.
#[async_trait]
pub trait DeltaSource: Send + Sync {
    async fn open_stream(&self, request: &ChatRequest) -> Result<DeltaStream>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Other(String),
}

impl FinishReason {
    pub fn parse(value: &str) -> Self {
        match value {
            "stop" => FinishReason::Stop,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Other(other) => other,
        }
    }
}

/// Partial tool-call data. `id` and `name` are usually only present on the
/// first fragment of a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: Option<u32>,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One incremental piece of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<FinishReason>,
}

impl StreamDelta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(fragment: ToolCallFragment) -> Self {
        Self {
            tool_calls: vec![fragment],
            ..Self::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Self::default()
        }
    }
}
