//! Error types for the event stream

use thiserror::Error;

/// Result type for event-stream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Event-stream errors
#[derive(Error, Debug)]
pub enum Error {
    /// A partition channel was closed (dispatcher shut down)
    #[error("Partition channel closed: {0}")]
    ChannelClosed(String),

    /// Event failed to deserialize
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
