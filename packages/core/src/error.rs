//! Error types for emitters and body piping.

use thiserror::Error;

/// Errors from [`EventEmitter`](crate::EventEmitter) listener management.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitterError {
    /// The handle does not refer to an attached listener.
    #[error("listener {id} is not attached to channel '{channel}'")]
    UnknownListener { channel: String, id: u64 },
}

/// Errors while moving a byte source into a request body.
#[derive(Debug, Error)]
pub enum BodyError {
    /// The body was already ended.
    #[error("request body already ended")]
    Ended,

    /// The receiving side went away before the chunk was written.
    #[error("request closed before the body was written")]
    Closed,

    /// No tokio runtime is available to drive the pump.
    #[error("no tokio runtime available to pipe the request body")]
    NoRuntime,

    /// The byte source could not be opened.
    #[error("failed to open body source: {0}")]
    Io(#[from] std::io::Error),
}
