pub mod api;
pub mod entry;
pub mod event;

pub use api::{ChatChunk, ChunkChoice, ChunkDelta, ChunkFunction, ChunkToolCall};
pub use entry::{Entry, FunctionCall, Role, ToolCallRequest};
pub use event::ResponseEvent;
