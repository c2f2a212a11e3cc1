//! The capability a connection invokes for inbound requests and notifications.

use std::future::Future;

use async_trait::async_trait;
use relay_core::errors::rpc::ErrorObject;
use relay_core::ids::RequestId;
use relay_core::wire::{Notification, Payload, Request};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Connection;

/// An inbound message that needs handling.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    /// Expects exactly one reply via [`Connection::reply`] or friends.
    Request(Request),
    /// One-way; cannot be answered.
    Notification(Notification),
}

impl Incoming {
    /// The method name.
    pub fn method(&self) -> &str {
        match self {
            Self::Request(r) => &r.method,
            Self::Notification(n) => &n.method,
        }
    }

    /// Raw parameters, if any.
    pub fn params(&self) -> Option<&Payload> {
        match self {
            Self::Request(r) => r.params.as_ref(),
            Self::Notification(n) => n.params.as_ref(),
        }
    }

    /// Caller metadata, if any.
    pub fn meta(&self) -> Option<&Payload> {
        match self {
            Self::Request(r) => r.meta.as_ref(),
            Self::Notification(n) => n.meta.as_ref(),
        }
    }

    /// The request id; `None` for notifications.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }
}

/// Application logic behind a connection.
///
/// For a request the handler must eventually reply exactly once through
/// `conn`. The connection imposes no timeout. `cancel` fires when the
/// connection stops being open.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one inbound message.
    async fn handle(&self, cancel: CancellationToken, conn: Connection, incoming: Incoming);
}

/// Answers every request with `METHOD_NOT_FOUND` and ignores notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHandler;

#[async_trait]
impl Handler for NullHandler {
    async fn handle(&self, _cancel: CancellationToken, conn: Connection, incoming: Incoming) {
        match incoming {
            Incoming::Request(req) => {
                if let Err(e) = conn
                    .reply_with_error(&req.id, ErrorObject::method_not_found(&req.method))
                    .await
                {
                    debug!(id = %req.id, error = %e, "reply failed");
                }
            }
            Incoming::Notification(n) => {
                debug!(method = %n.method, "ignoring notification");
            }
        }
    }
}

/// [`Handler`] built from an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Adapt an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CancellationToken, Connection, Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CancellationToken, Connection, Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, cancel: CancellationToken, conn: Connection, incoming: Incoming) {
        (self.0)(cancel, conn, incoming).await;
    }
}
