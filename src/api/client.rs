use super::logging::{debug_payload_enabled, emit_debug_payload};
use super::stream::delta_stream;
use super::{ChatRequest, DeltaSource, DeltaStream};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{Entry, Role};
use crate::util::is_local_endpoint_url;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};

/// Streams chat completions from an OpenAI-compatible endpoint.
pub struct ChatClient {
    http: reqwest::Client,
    api_key: Option<String>,
    api_url: String,
}

impl ChatClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::Transport(format!("cannot build HTTP client: {error}")))?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_url: config.api_url.clone(),
        })
    }

    fn request_url(&self) -> String {
        adapt_to_openai_chat_completions_url(&self.api_url)
    }
}

#[async_trait]
impl DeltaSource for ChatClient {
    async fn open_stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        let request_url = self.request_url();
        let payload = request_body(request);

        if debug_payload_enabled() {
            emit_debug_payload(&request_url, &payload);
        }

        let mut builder = self
            .http
            .post(&request_url)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .json(&payload);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        tracing::debug!(
            url = %request_url,
            model = %request.model,
            messages = request.messages.len(),
            "opening chat completion stream"
        );

        let response = builder
            .send()
            .await
            .map_err(|error| map_api_request_error(error, &request_url))?
            .error_for_status()
            .map_err(|error| map_api_request_error(error, &request_url))?;

        let request_url_for_stream = request_url.clone();
        let bytes = response.bytes_stream().map(move |item| {
            item.map_err(|error| map_api_request_error(error, &request_url_for_stream))
        });
        Ok(delta_stream(Box::pin(bytes)))
    }
}

fn map_api_request_error(error: reqwest::Error, request_url: &str) -> Error {
    if error.is_connect() && is_local_endpoint_url(request_url) {
        return Error::Transport(format!(
            "cannot reach local API endpoint '{request_url}': {error}. Start your local server or update OPENAI_BASE_URL."
        ));
    }
    if error.is_connect() {
        return Error::Transport(format!("cannot reach API endpoint '{request_url}': {error}"));
    }
    if error.is_timeout() {
        return Error::Transport(format!("API request to '{request_url}' timed out: {error}"));
    }
    if let Some(status) = error.status() {
        return Error::Transport(format!(
            "API endpoint '{request_url}' returned HTTP {status}: {error}"
        ));
    }
    Error::Transport(format!("API request to '{request_url}' failed: {error}"))
}

fn adapt_to_openai_chat_completions_url(api_url: &str) -> String {
    let normalized = api_url.trim().trim_end_matches('/');
    if normalized.ends_with("/chat/completions") {
        return normalized.to_string();
    }
    if let Some(prefix) = normalized.strip_suffix("/messages") {
        return format!("{prefix}/chat/completions");
    }
    if normalized.ends_with("/v1") {
        return format!("{normalized}/chat/completions");
    }
    normalized.to_string()
}

fn request_body(request: &ChatRequest) -> Value {
    let mut payload = json!({
        "model": request.model,
        "messages": wire_messages(&request.messages),
        "temperature": request.temperature,
        "stream": true,
    });
    if !request.tools.is_empty() {
        if let Some(object) = payload.as_object_mut() {
            let tools = request.tools.iter().map(|tool| tool.to_wire()).collect();
            object.insert("tools".to_string(), Value::Array(tools));
            object.insert("tool_choice".to_string(), json!("auto"));
        }
    }
    payload
}

fn wire_messages(entries: &[Entry]) -> Vec<Value> {
    entries.iter().map(wire_message).collect()
}

fn wire_message(entry: &Entry) -> Value {
    let mut message = Map::new();
    message.insert("role".to_string(), json!(entry.role.as_str()));

    match entry.role {
        Role::Assistant if entry.issues_tool_calls() => {
            if entry.content.is_empty() {
                message.insert("content".to_string(), Value::Null);
            } else {
                message.insert("content".to_string(), json!(entry.content));
            }
            let calls = entry
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.function.name,
                            "arguments": call.function.arguments,
                        }
                    })
                })
                .collect();
            message.insert("tool_calls".to_string(), Value::Array(calls));
        }
        Role::Tool => {
            message.insert("content".to_string(), json!(entry.content));
            if let Some(id) = &entry.tool_call_id {
                message.insert("tool_call_id".to_string(), json!(id));
            }
            if let Some(name) = &entry.name {
                message.insert("name".to_string(), json!(name));
            }
        }
        _ => {
            message.insert("content".to_string(), json!(entry.content));
        }
    }

    Value::Object(message)
}
