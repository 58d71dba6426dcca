mod core;
mod history;
mod state;
mod streaming;

#[cfg(test)]
mod tests;

pub use history::project_history;
pub use state::{Session, SessionOptions, SessionState, TurnOutcome};
pub use streaming::{AssembledTurn, TurnAssembler, TurnMode};
