//! Tool schemas advertised to the model. Execution lives outside this crate;
//! results come back through `Session::submit_tool_result`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }

    /// Chat-completions `tools[]` element.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "shell",
            "Execute a shell command",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The shell command to execute" }
                },
                "required": ["command"]
            }),
        ),
        ToolDefinition::new(
            "read_file",
            "Read the contents of a file",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "The path to the file" }
                },
                "required": ["path"]
            }),
        ),
        ToolDefinition::new(
            "write_file",
            "Write content to a file, replacing existing content or creating a new file. Use patch_file for modifying existing files.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "The path to the file" },
                    "content": { "type": "string", "description": "The full content to write" }
                },
                "required": ["path", "content"]
            }),
        ),
        ToolDefinition::new(
            "patch_file",
            "Modify an existing file by applying a patch. Preferred for edits over write_file.",
            json!({
                "type": "object",
                "properties": {
                    "patch_content": {
                        "type": "string",
                        "description": "The patch content, including // FILE:, // EDIT:, // END_EDIT, ADD:, and DEL: markers."
                    }
                },
                "required": ["patch_content"]
            }),
        ),
        ToolDefinition::new(
            "list_directory",
            "List the contents of a directory",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "The path to the directory" }
                },
                "required": ["path"]
            }),
        ),
    ]
}
