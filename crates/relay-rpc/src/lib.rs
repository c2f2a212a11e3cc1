//! # relay-rpc
//!
//! Bidirectional JSON-RPC 2.0 connections over any message-oriented stream.
//!
//! - [`stream`]: the [`ObjectStream`] transport abstraction and an in-memory pair
//! - [`pending`]: correlation of outbound calls with their responses
//! - [`connection`]: the [`Connection`] read loop, calls, notifications, replies, shutdown
//! - [`handler`] / [`registry`]: application code answering inbound messages
//! - [`observer`]: traffic and anomaly hooks
//!
//! Both peers are symmetric: either side may call, notify, or answer.

#![deny(unsafe_code)]

pub mod connection;
pub mod handler;
pub mod observer;
pub mod pending;
pub mod registry;
mod replies;
pub mod stream;

pub use connection::{
    CallOptions, CloseReason, Connection, ConnectionBuilder, ConnectionState, DisconnectSignal,
    ResponseWaiter,
};
pub use handler::{FnHandler, Handler, Incoming, NullHandler, handler_fn};
pub use observer::{ConnectionObserver, DefaultObserver, TracingObserver};
pub use pending::{PendingCall, PendingCallTable};
pub use registry::{CallContext, MethodHandler, MethodRegistry, method_fn};
pub use stream::{MemoryObjectStream, ObjectStream, ReceiveError};

pub use relay_core::{
    CancelReason, Envelope, ErrorObject, Notification, Payload, ProtocolError, RelayError,
    Request, RequestId, Response, Result, TransportError,
};
pub use relay_settings::{ConnectionSettings, DispatchMode};
pub use tokio_util::sync::CancellationToken;
