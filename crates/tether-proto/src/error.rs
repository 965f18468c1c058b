//! Error types for message parsing.

use thiserror::Error;

/// Errors produced when parsing a wire line into a [`Message`](crate::Message).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The line was empty (or whitespace only) after stripping CRLF.
    #[error("empty message")]
    EmptyMessage,

    /// The line had tags or a prefix but no command.
    #[error("missing command in: {0}")]
    MissingCommand(String),

    /// A tag section was present but malformed.
    #[error("malformed tags in: {0}")]
    MalformedTags(String),
}
