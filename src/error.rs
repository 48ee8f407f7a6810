//! Error types for the jusu-lsp language client.
//!
//! Errors are organized by the layer that produces them: launching the
//! server process, framing bytes on its stdio, interpreting JSON-RPC traffic,
//! and driving a client session. [`Error`] unifies them for the host-facing
//! entry points.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lsp::SessionState;

/// Errors raised while starting the language server process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The executable could not be resolved to a runnable program.
    #[error("language server executable not found: {program}")]
    NotFound {
        /// The executable identifier as configured.
        program: String,
    },

    /// The operating system refused to spawn the process.
    #[error("failed to spawn language server '{program}': {source}")]
    SpawnFailed {
        /// The executable identifier as configured.
        program: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the framed stdio transport.
///
/// Carries rendered messages rather than `io::Error` so a single failure can
/// be fanned out to every request that was waiting on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Writing a frame to the server's stdin failed.
    #[error("failed to write to language server: {0}")]
    WriteFailed(String),

    /// Reading from the server's stdout failed or ended mid-stream.
    #[error("failed to read from language server: {0}")]
    ReadFailed(String),

    /// The server produced bytes that do not form a valid frame.
    #[error("malformed frame from language server: {0}")]
    MalformedFrame(String),
}

/// Errors in the JSON-RPC conversation itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A response arrived for a request id that is not pending.
    #[error("response for unknown request id {0}")]
    UnknownResponseId(String),

    /// An operation was invoked in a state that forbids it.
    #[error("cannot {operation} while the session is {state}")]
    UnexpectedState {
        /// The attempted operation.
        operation: String,
        /// The session state at the time of the attempt.
        state: SessionState,
    },

    /// A frame body was not a JSON-RPC 2.0 message.
    #[error("invalid JSON-RPC message: {0}")]
    InvalidMessage(String),
}

/// Errors surfaced by client session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server process could not be started.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The operation violated the protocol or the session state machine.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The language server answered with an error response.
    #[error("language server error: {message} (code: {code})")]
    Server {
        /// The JSON-RPC error code.
        code: i64,
        /// The error message from the language server.
        message: String,
    },

    /// A request did not complete in time.
    #[error("language server request timed out after {0:?}")]
    Timeout(Duration),

    /// The request was cancelled before a response arrived.
    #[error("request was cancelled")]
    Cancelled,

    /// The session stopped while the request was still pending.
    #[error("session stopped before the request completed")]
    Stopped,

    /// A message could not be serialized or a result could not be decoded.
    #[error("failed to encode or decode message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A unified error type for the host-facing entry points.
#[derive(Debug, Error)]
pub enum Error {
    /// Session-related error.
    #[error("language server failed: {0}")]
    Session(#[from] SessionError),

    /// `activate` was called while a session is already held.
    #[error("the extension is already active")]
    AlreadyActive,

    /// `deactivate` was called before `activate` finished; the new session
    /// has been stopped.
    #[error("the extension was deactivated while activating")]
    Deactivated,

    /// A path could not be expressed as a `file://` URI.
    #[error("invalid document path: {}", .0.display())]
    InvalidPath(PathBuf),

    /// A user-facing position was out of range.
    #[error("invalid position: line {line}, column {column}")]
    InvalidPosition {
        /// The 1-indexed line number.
        line: u32,
        /// The 1-indexed column number.
        column: u32,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for jusu-lsp operations.
pub type Result<T> = std::result::Result<T, Error>;
