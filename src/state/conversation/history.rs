use crate::types::{Entry, Role};
use indexmap::IndexSet;

/// Maps the log to the sequence that is legal to send upstream.
///
/// Assistant text is withheld while tool results are still owed, and
/// tool-call entries go out with empty content.
pub fn project_history(entries: &[Entry]) -> Vec<Entry> {
    let mut projected = Vec::with_capacity(entries.len());
    let mut expected_results: IndexSet<&str> = IndexSet::new();

    for entry in entries {
        match entry.role {
            Role::Assistant if entry.issues_tool_calls() => {
                for call in &entry.tool_calls {
                    expected_results.insert(call.id.as_str());
                }
                let mut outbound = entry.clone();
                outbound.content.clear();
                projected.push(outbound);
            }
            Role::Assistant => {
                if expected_results.is_empty() {
                    projected.push(entry.clone());
                } else {
                    tracing::debug!(
                        awaiting = expected_results.len(),
                        "withholding assistant text while tool results are outstanding"
                    );
                }
            }
            Role::Tool => {
                let id = entry.tool_call_id.as_deref().unwrap_or_default();
                if !expected_results.shift_remove(id) {
                    tracing::warn!(
                        tool_call_id = id,
                        "tool result does not answer an outstanding tool call"
                    );
                }
                projected.push(entry.clone());
            }
            Role::User | Role::System => projected.push(entry.clone()),
        }
    }

    projected
}
