/// Error type shared by every turnloom module.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Transport(String),

    #[error("stream ended without a finish marker")]
    MissingFinishMarker,

    #[error("stream finished with `{reason}` while tool calls were being assembled")]
    UnexpectedFinish { reason: String },

    #[error("turn cancelled")]
    Cancelled,

    #[error("follow-up limit reached after {0} consecutive tool rounds")]
    FollowupLimit(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
