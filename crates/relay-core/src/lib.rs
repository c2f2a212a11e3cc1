//! # relay-core
//!
//! Foundation types shared by every relay crate:
//!
//! - [`ids::RequestId`]: numeric or string correlation token
//! - [`wire`]: JSON-RPC 2.0 envelopes, lazily-decoded [`wire::Payload`]s and the codec
//! - [`errors`]: transport / protocol / remote error taxonomy
//! - [`logging`]: `tracing` subscriber setup and log capture for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod wire;

pub use errors::rpc::ErrorObject;
pub use errors::{CancelReason, ProtocolError, RelayError, Result, TransportError};
pub use ids::RequestId;
pub use wire::{Envelope, Notification, Payload, Request, Response};
