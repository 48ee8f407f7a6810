//! JSON-RPC envelopes and small conversion helpers.
//!
//! Outgoing messages are serialized from the envelope structs here; incoming
//! frame bodies are classified by [`IncomingMessage::parse`] into responses,
//! server-initiated requests and notifications.

use std::path::Path;

use lsp_types::{Position, Url};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, ProtocolError};

/// JSON-RPC error code for an unsupported method.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct OutgoingRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> OutgoingRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params: non_null(params),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OutgoingNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> OutgoingNotification<'a> {
    pub fn new(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params: non_null(params),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OutgoingErrorResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub error: ResponseError,
}

impl OutgoingErrorResponse {
    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            error: ResponseError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {method}"),
            },
        }
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IncomingMessage {
    Response {
        id: Value,
        outcome: Result<Value, ResponseError>,
    },
    Request {
        id: Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl IncomingMessage {
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::InvalidMessage(format!("body is not JSON: {e}")))?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::InvalidMessage(
                "message is not a JSON object".to_string(),
            ));
        };

        let id = object.remove("id");
        let method = match object.remove("method") {
            Some(Value::String(method)) => Some(method),
            Some(_) => {
                return Err(ProtocolError::InvalidMessage(
                    "method is not a string".to_string(),
                ));
            }
            None => None,
        };

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method }),
            (None, Some(method)) => Ok(Self::Notification {
                method,
                params: object.remove("params"),
            }),
            (Some(id), None) => {
                if let Some(error) = object.remove("error") {
                    Ok(Self::Response {
                        id,
                        outcome: Err(parse_response_error(&error)),
                    })
                } else if let Some(result) = object.remove("result") {
                    Ok(Self::Response {
                        id,
                        outcome: Ok(result),
                    })
                } else {
                    Err(ProtocolError::InvalidMessage(
                        "response has neither result nor error".to_string(),
                    ))
                }
            }
            (None, None) => Err(ProtocolError::InvalidMessage(
                "message has neither id nor method".to_string(),
            )),
        }
    }
}

fn parse_response_error(error: &Value) -> ResponseError {
    ResponseError {
        code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    }
}

fn non_null(params: Value) -> Option<Value> {
    if params.is_null() { None } else { Some(params) }
}

/// Converts a path to a `file://` URI.
///
/// Relative paths are resolved against the current directory and the result
/// is canonicalized, so the file must exist.
/// ## Errors
/// [`Error::InvalidPath`] if the path cannot be resolved.
pub fn path_to_url(path: &Path) -> crate::Result<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let canonical = absolute
        .canonicalize()
        .map_err(|_| Error::InvalidPath(path.to_path_buf()))?;

    Url::from_file_path(&canonical).map_err(|()| Error::InvalidPath(canonical))
}

/// Converts a user-facing 1-indexed position to an LSP 0-indexed position.
///
/// # Errors
///
/// Returns error if line or column is 0.
pub fn to_lsp_position(line: u32, column: u32) -> crate::Result<Position> {
    if line == 0 || column == 0 {
        return Err(Error::InvalidPosition { line, column });
    }
    Ok(Position {
        line: line - 1,
        character: column - 1,
    })
}

/// Converts an LSP 0-indexed position to a 1-indexed `(line, column)` pair.
pub fn from_lsp_position(position: Position) -> (u32, u32) {
    (
        position.line.saturating_add(1),
        position.character.saturating_add(1),
    )
}
