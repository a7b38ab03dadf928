//! Error types shared by the server and client sessions.
//!
//! A clean close of the peer's stream is not an error: readers report it as
//! `Ok(None)`. Everything here stays local to the task that hit it.

use thiserror::Error;

/// A line that does not follow the wire grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Line did not match any known message.
    #[error("malformed line: {0:?}")]
    Malformed(String),

    /// Line parsed, but that message kind is not valid in this direction.
    #[error("unexpected message: {0:?}")]
    Unexpected(String),

    /// Line exceeded the maximum accepted length, given here.
    #[error("line longer than {0} bytes")]
    LineTooLong(usize),

    /// Line was not valid UTF-8.
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Why a session (one connection) ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// I/O failure on the stream.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Peer sent something we cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Appending to the participant's journal failed.
    #[error("journal write failed: {0}")]
    Journal(#[source] std::io::Error),
}
