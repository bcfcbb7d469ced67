use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("coordination store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("broadcast channel closed")]
    ChannelClosed,

    #[error("protocol mismatch: {0}")]
    Protocol(String),

    #[error("round stalled: {0}")]
    Stall(String),

    #[error("chunk computation failed: {0}")]
    Compute(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
