use crate::util::parse_bool_flag;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;

const DEBUG_PAYLOAD_ENV: &str = "TURNLOOM_DEBUG_PAYLOAD";
const API_LOG_PATH_ENV: &str = "TURNLOOM_API_LOG_PATH";

pub fn debug_payload_enabled() -> bool {
    std::env::var(DEBUG_PAYLOAD_ENV)
        .ok()
        .and_then(parse_bool_flag)
        .unwrap_or(false)
}

pub fn emit_debug_payload(request_url: &str, payload: &Value) {
    let formatted_payload = serde_json::to_string_pretty(payload)
        .unwrap_or_else(|_| "<payload serialization error>".to_string());
    let message = format!(
        "TURNLOOM_API DEBUG payload_request url={request_url}\npayload:\n{formatted_payload}\n"
    );
    if !append_to_api_log(&message) {
        tracing::debug!(url = %request_url, payload = %formatted_payload, "chat request payload");
    }
}

pub fn emit_sse_parse_error(
    event_type: Option<&str>,
    json_data: &str,
    parse_error: &serde_json::Error,
) {
    let message = format!(
        "TURNLOOM_API ERROR sse_parse_failed error={parse_error}\nevent_type={}\ndata:\n{json_data}\n",
        event_type.unwrap_or("<none>")
    );
    if !append_to_api_log(&message) {
        tracing::warn!(
            error = %parse_error,
            event_type = event_type.unwrap_or("<none>"),
            data = json_data,
            "skipping unparseable stream payload"
        );
    }
}

/// Returns false when no log file is configured or the write failed.
fn append_to_api_log(message: &str) -> bool {
    let Some(path) = resolve_log_path() else {
        return false;
    };
    match append_log_file(&path, message) {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(path = %path, %error, "cannot append to API log");
            false
        }
    }
}

fn resolve_log_path() -> Option<String> {
    std::env::var(API_LOG_PATH_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn append_log_file(path: &str, message: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(message.as_bytes())
}
