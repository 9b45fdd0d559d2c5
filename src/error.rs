//! Error types for the chat server
//!
//! Defines server lifecycle errors and the mailbox receive timeout.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Server lifecycle errors
///
/// Lifecycle transitions are compare-and-swap guarded: when several callers
/// race for the same transition exactly one succeeds and the rest receive
/// one of these variants.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `run` called while the server is not Offline
    #[error("Server is already running")]
    AlreadyRunning,

    /// `join` called while the server is Offline or Ended
    #[error("Server is not running")]
    NotRunning,

    /// `stop`/`shutdown` called while the server is not Online
    #[error("Server is not online")]
    NotOnline,

    /// `stop` called after the server already reached Ended
    #[error("Server is already ended")]
    AlreadyEnded,

    /// IO error while binding the listening socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Timed-out mailbox receive
///
/// Returned by `Mailbox::take` when no value arrives within the given
/// timeout. For a session's processing loop this is a no-op heartbeat,
/// not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Timed out waiting for a message")]
pub struct TakeTimeout;
