//! Network error types.

/// Errors raised while decoding a received message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The payload ended before a field could be read.
    #[error("Truncated message: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    /// A string field was not valid UTF-8.
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A participant type value outside the known set.
    #[error("Unknown participant type {0}")]
    UnknownParticipantType(u32),

    /// A chunked payload delivered more bytes than it announced.
    #[error("Chunked payload overran its announced size of {expected} bytes")]
    ChunkOverrun { expected: usize },
}

/// Errors that can occur in the scenemesh_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Binding or listening on the acceptor socket failed.
    #[error("Acceptor error: {0}")]
    Acceptor(std::io::Error),

    /// The background event loop could not be started.
    #[error("Event loop error: {0}")]
    EventLoop(String),

    /// The config could not be serialized to JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
