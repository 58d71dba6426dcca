pub mod conversation;
mod message_log;
mod pending_calls;

pub use conversation::{
    project_history, AssembledTurn, Session, SessionOptions, SessionState, TurnAssembler,
    TurnMode, TurnOutcome,
};
pub use message_log::MessageLog;
pub use pending_calls::PendingCalls;
