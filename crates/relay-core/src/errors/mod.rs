//! Error hierarchy for relay connections.
//!
//! Built on [`thiserror`]:
//!
//! - [`TransportError`]: the underlying stream failed; terminal for a connection
//! - [`ProtocolError`]: the peer sent something we can't use; reported, never fatal
//! - [`RelayError`]: what callers of the connection API see
//!
//! The JSON-RPC error object and standard codes live in [`rpc`].

pub mod rpc;

use std::time::Duration;

use thiserror::Error;

use crate::errors::rpc::ErrorObject;
use crate::ids::RequestId;

/// Result alias for connection operations.
pub type Result<T> = std::result::Result<T, RelayError>;

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of the message transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away without a clean close.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The stream was already closed locally.
    #[error("stream closed")]
    Closed,

    /// WebSocket-level failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An outbound envelope could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// ProtocolError
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum number of raw bytes kept in [`ProtocolError::Malformed`].
pub const RAW_EXCERPT_LIMIT: usize = 256;

/// Something the peer sent that does not fit the protocol.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ProtocolError {
    /// The message is not a valid JSON-RPC 2.0 envelope.
    #[error("malformed message: {reason}")]
    Malformed {
        /// What was wrong.
        reason: String,
        /// The offending text, truncated to [`RAW_EXCERPT_LIMIT`] bytes.
        raw: String,
    },

    /// A response arrived for an id with no outstanding call.
    #[error("response for unknown id {id}")]
    UnmatchedResponse {
        /// The id the peer answered.
        id: RequestId,
    },

    /// An error response with a null id.
    #[error("error response without id: {error}")]
    OrphanError {
        /// The error the peer reported.
        error: ErrorObject,
    },

    /// The peer reused an inbound id that is still awaiting our reply.
    #[error("duplicate inbound request id {id}")]
    DuplicateInboundId {
        /// The reused id.
        id: RequestId,
    },

    /// A transport frame that cannot carry an envelope.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: String,
    },
}

impl ProtocolError {
    /// Build a [`ProtocolError::Malformed`], truncating `raw` on a char boundary.
    pub fn malformed(reason: impl Into<String>, raw: &str) -> Self {
        let mut end = raw.len().min(RAW_EXCERPT_LIMIT);
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        Self::Malformed {
            reason: reason.into(),
            raw: raw[..end].to_owned(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RelayError
// ─────────────────────────────────────────────────────────────────────────────

/// Why a call stopped waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Token,
    /// The call deadline elapsed.
    Deadline(Duration),
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token => f.write_str("cancelled by caller"),
            Self::Deadline(d) => write!(f, "timed out after {}ms", d.as_millis()),
        }
    }
}

/// Error returned by connection operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The transport failed while sending.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol violation surfaced to the caller.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer answered with an error object.
    #[error("remote error {0}")]
    Remote(ErrorObject),

    /// The call stopped waiting before a response arrived.
    #[error("call {reason}")]
    Cancelled {
        /// Token or deadline.
        reason: CancelReason,
    },

    /// The connection is closing or closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A reply for an id that was already answered or never dispatched.
    #[error("request {id} already answered or unknown")]
    DoubleReply {
        /// The id being replied to.
        id: RequestId,
    },

    /// A caller-chosen id is already outstanding.
    #[error("request id {id} already in flight")]
    DuplicateId {
        /// The clashing id.
        id: RequestId,
    },

    /// A payload did not decode to the requested type.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

impl RelayError {
    /// The remote error object, if the peer answered with one.
    pub fn remote(&self) -> Option<&ErrorObject> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this error means the connection is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Transport(_))
    }
}
