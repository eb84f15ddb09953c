use thiserror::Error;

#[derive(Error, Debug)]
pub enum StationError {
    #[error("Station error: {0}")]
    Station(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Command queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Refusing to queue a zero-length command")]
    EmptyPayload,

    #[error("Unterminated frame exceeded {limit} bytes ({len} buffered)")]
    FrameOverflow { len: usize, limit: usize },

    #[error("A question is already pending")]
    QuestionPending,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] kestrel_core::KestrelError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StationError>;
