//! Error types shared by the host and client halves of the bridge.
//!
//! The taxonomy mirrors how failures are handled:
//!
//! - `Configuration` - environment defect found before anything is spawned
//! - `Protocol` - a message that does not fit the grammar; never retried
//! - `RemoteExecution` - the engine itself raised; the session is dead
//! - `TransportClosed` - the peer is gone
//! - `TypeMismatch` - a value that does not fit the base/handle/list grammar

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::framing::FrameError;
use crate::protocol::HandleId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Top-level error for every bridge operation.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Engine or library path could not be resolved.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A message did not match any recognized shape.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The engine raised while servicing a call.
    #[error("Remote execution failed: {0}")]
    RemoteExecution(String),

    /// Send or receive issued after the peer exited.
    #[error("Transport closed")]
    TransportClosed,

    /// A value outside the base/handle/list grammar.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Framing failure below the message layer.
    #[error("Framing error: {0}")]
    Frame(#[source] FrameError),

    /// Message (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error outside of the transport (log files, process spawn).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for BridgeError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Closed => BridgeError::TransportClosed,
            FrameError::Io(e) if is_disconnect(&e) => BridgeError::TransportClosed,
            other => BridgeError::Frame(other),
        }
    }
}

impl BridgeError {
    /// Whether this error means the peer is gone and the session is dead.
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, BridgeError::TransportClosed)
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

/// Violations of the wire grammar, detected on either side.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown object id {0}")]
    UnknownHandle(HandleId),

    #[error("malformed handle: {0}")]
    MalformedHandle(String),

    #[error("unknown geometry kind: {0}")]
    UnknownGeometryKind(String),

    #[error("expected {expected} response, got {got}")]
    UnexpectedResponse { expected: &'static str, got: String },

    /// A request that is valid in general but not in the current dispatch state.
    #[error("out of order: {0}")]
    OutOfOrder(String),

    /// Violation reported by the peer rather than detected locally.
    #[error("rejected by peer: {0}")]
    Rejected(String),
}

/// Error classes that can be carried back to the host in an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Protocol,
    TypeMismatch,
}

/// Structured error payload sent by the client instead of a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    /// Offending id, when the error is about a registry lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<HandleId>,
}

impl RemoteError {
    pub fn protocol(err: &ProtocolError) -> Self {
        let id = match err {
            ProtocolError::UnknownHandle(id) => Some(*id),
            _ => None,
        };
        Self {
            kind: RemoteErrorKind::Protocol,
            message: err.to_string(),
            id,
        }
    }
}

impl RemoteError {
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::TypeMismatch,
            message: message.into(),
            id: None,
        }
    }
}

impl From<RemoteError> for BridgeError {
    fn from(err: RemoteError) -> Self {
        match (err.kind, err.id) {
            (RemoteErrorKind::Protocol, Some(id)) => {
                BridgeError::Protocol(ProtocolError::UnknownHandle(id))
            }
            (RemoteErrorKind::Protocol, None) => {
                BridgeError::Protocol(ProtocolError::Rejected(err.message))
            }
            (RemoteErrorKind::TypeMismatch, _) => BridgeError::TypeMismatch(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::Configuration("no engine library".to_string());
        assert_eq!(err.to_string(), "Configuration error: no engine library");

        let err = BridgeError::Protocol(ProtocolError::UnknownHandle(HandleId(7)));
        assert_eq!(err.to_string(), "Protocol error: unknown object id mbx:7");

        assert_eq!(BridgeError::TransportClosed.to_string(), "Transport closed");
    }

    #[test]
    fn test_frame_closed_maps_to_transport_closed() {
        let err: BridgeError = FrameError::Closed.into();
        assert!(err.is_transport_closed());

        let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: BridgeError = FrameError::Io(pipe).into();
        assert!(err.is_transport_closed());

        let err: BridgeError = FrameError::MissingContentLength.into();
        assert!(matches!(err, BridgeError::Frame(_)));
    }

    #[test]
    fn test_remote_error_keeps_unknown_id() {
        let remote = RemoteError::protocol(&ProtocolError::UnknownHandle(HandleId(12)));
        let err: BridgeError = remote.into();
        match err {
            BridgeError::Protocol(ProtocolError::UnknownHandle(id)) => assert_eq!(id, HandleId(12)),
            other => panic!("Expected UnknownHandle, got {:?}", other),
        }
    }
}
