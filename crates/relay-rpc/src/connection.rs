//! A bidirectional JSON-RPC 2.0 connection over an [`ObjectStream`].
//!
//! One read task per connection receives envelopes and routes them:
//! responses to the [`PendingCallTable`], requests and notifications to the
//! [`Handler`]. Any number of tasks may call, notify and reply concurrently.
//!
//! ```text
//!   Open ──close() / end of stream / receive error / send failure──▶ Closing
//!   Closing ──read loop exited, pending calls cancelled──▶ Closed
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::errors::rpc::ErrorObject;
use relay_core::errors::{CancelReason, ProtocolError, RelayError, Result, TransportError};
use relay_core::ids::RequestId;
use relay_core::wire::{Envelope, Notification, Payload, Request, Response};
use relay_settings::{ConnectionSettings, DispatchMode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::handler::{Handler, Incoming, NullHandler};
use crate::observer::{ConnectionObserver, DefaultObserver, TracingObserver};
use crate::pending::{PendingCall, PendingCallTable};
use crate::replies::ReplyTracker;
use crate::stream::{ObjectStream, ReceiveError};

// ── State ───────────────────────────────────────────────────────────

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Calls, notifications and replies are accepted.
    Open,
    /// Shutting down; new operations fail with `ConnectionClosed`.
    Closing,
    /// Read loop finished and every pending call resolved.
    Closed,
}

/// Why a connection left `Open`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Connection::close`] was called.
    Local,
    /// The peer closed the stream.
    EndOfStream,
    /// Receiving failed.
    Transport(String),
    /// Sending failed.
    SendFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::EndOfStream => f.write_str("end of stream"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::SendFailed(msg) => write!(f, "send failed: {msg}"),
        }
    }
}

struct StateCell {
    state: ConnectionState,
    reason: Option<CloseReason>,
}

// ── Options ─────────────────────────────────────────────────────────

/// Per-call settings for [`Connection::call_with_options`].
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Use this id instead of a generated one.
    pub id: Option<RequestId>,
    /// Metadata sent in the request's `meta` member.
    pub meta: Option<Payload>,
    /// Give up after this long. Overrides the connection's `callTimeoutMs`.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Use a caller-chosen id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach request metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Payload) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Set a deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ── Waiters and signals ─────────────────────────────────────────────

/// A sent request whose response has not been collected yet.
///
/// Dropping it abandons the call; a response arriving later is reported
/// as unmatched.
#[derive(Debug)]
pub struct ResponseWaiter {
    call: PendingCall,
    timeout: Option<Duration>,
}

impl ResponseWaiter {
    /// The request id.
    pub fn id(&self) -> &RequestId {
        self.call.id()
    }

    /// Wait for the result, the token, or the deadline.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<Payload> {
        let timeout = self.timeout;
        tokio::select! {
            biased;
            outcome = self.call.wait() => match outcome {
                Ok(Response { result: Ok(payload), .. }) => Ok(payload),
                Ok(Response { result: Err(error), .. }) => Err(RelayError::Remote(error)),
                Err(_) => Err(RelayError::ConnectionClosed),
            },
            () = cancel.cancelled() => Err(RelayError::Cancelled { reason: CancelReason::Token }),
            () = sleep_or_forever(timeout) => Err(RelayError::Cancelled {
                reason: CancelReason::Deadline(timeout.unwrap_or_default()),
            }),
        }
    }

    /// Wait and decode the result into `R`.
    pub async fn wait_as<R: DeserializeOwned>(self, cancel: &CancellationToken) -> Result<R> {
        let payload = self.wait(cancel).await?;
        payload.decode().map_err(RelayError::InvalidPayload)
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Fires once when the connection reaches `Closed`.
#[derive(Clone, Debug)]
pub struct DisconnectSignal {
    token: CancellationToken,
}

impl DisconnectSignal {
    /// Wait until the connection is closed. Returns immediately if it already is.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Whether the connection is closed.
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ── Builder ─────────────────────────────────────────────────────────

/// Configures and starts a [`Connection`].
pub struct ConnectionBuilder {
    stream: Arc<dyn ObjectStream>,
    handler: Arc<dyn Handler>,
    observer: Arc<dyn ConnectionObserver>,
    settings: ConnectionSettings,
    name: Option<String>,
}

impl ConnectionBuilder {
    /// Handler for inbound requests and notifications. Defaults to [`NullHandler`].
    #[must_use]
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Shared handler instance.
    #[must_use]
    pub fn shared_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = handler;
        self
    }

    /// Primary observer. Defaults to [`DefaultObserver`].
    #[must_use]
    pub fn observer(mut self, observer: impl ConnectionObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Connection settings.
    #[must_use]
    pub fn settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Label for logs. Overrides `settings.name`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawn the read loop on the current tokio runtime and return the handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(self) -> Connection {
        let name = self
            .name
            .or_else(|| self.settings.name.clone())
            .unwrap_or_else(|| format!("conn-{}", Uuid::now_v7()));

        let mut observers = vec![self.observer];
        if self.settings.log_messages {
            observers.push(Arc::new(TracingObserver::new(name.clone())));
        }

        let conn = Connection {
            inner: Arc::new(Inner {
                stream: self.stream,
                handler: self.handler,
                observers,
                settings: self.settings,
                pending: PendingCallTable::new(),
                replies: ReplyTracker::default(),
                next_id: AtomicU64::new(0),
                state: Mutex::new(StateCell {
                    state: ConnectionState::Open,
                    reason: None,
                }),
                cancel: CancellationToken::new(),
                disconnected: CancellationToken::new(),
                name,
            }),
        };

        let span = info_span!("connection", name = %conn.inner.name);
        let _ = tokio::spawn(read_loop(conn.clone()).instrument(span));
        conn
    }
}

// ── Connection ──────────────────────────────────────────────────────

struct Inner {
    name: String,
    stream: Arc<dyn ObjectStream>,
    handler: Arc<dyn Handler>,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    settings: ConnectionSettings,
    pending: Arc<PendingCallTable>,
    replies: ReplyTracker,
    next_id: AtomicU64,
    state: Mutex<StateCell>,
    /// Fired on leaving `Open`; handed to handlers.
    cancel: CancellationToken,
    /// Fired on reaching `Closed`.
    disconnected: CancellationToken,
}

/// Handle to a running connection. Cheap to clone.
///
/// The read loop keeps the connection alive until the stream ends or
/// [`Connection::close`] is called; dropping handles does not close it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Start a connection with a handler and settings.
    pub fn new(
        stream: impl ObjectStream,
        handler: impl Handler,
        settings: ConnectionSettings,
    ) -> Self {
        Self::builder(stream)
            .handler(handler)
            .settings(settings)
            .start()
    }

    /// Configure a connection over `stream`.
    pub fn builder(stream: impl ObjectStream) -> ConnectionBuilder {
        ConnectionBuilder {
            stream: Arc::new(stream),
            handler: Arc::new(NullHandler),
            observer: Arc::new(DefaultObserver),
            settings: ConnectionSettings::default(),
            name: None,
        }
    }

    /// Label used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state
    }

    /// Whether the connection reached `Closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Why the connection left `Open`, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.state.lock().reason.clone()
    }

    /// Number of outbound calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of inbound requests not yet answered.
    pub fn unanswered_requests(&self) -> usize {
        self.inner.replies.len()
    }

    /// Token fired when the connection stops being open.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Signal fired once the connection is closed.
    pub fn disconnect_notify(&self) -> DisconnectSignal {
        DisconnectSignal {
            token: self.inner.disconnected.clone(),
        }
    }

    // ── Outbound calls ──

    /// Call `method` and decode the result.
    ///
    /// `params` serializing to `null` are omitted from the request.
    pub async fn call<P, R>(&self, cancel: &CancellationToken, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with_options(cancel, method, params, CallOptions::default())
            .await
    }

    /// [`Connection::call`] with an explicit id, metadata or deadline.
    ///
    /// The token and the deadline cover the whole call, including a send
    /// stalled on transport backpressure.
    pub async fn call_with_options<P, R>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: &P,
        options: CallOptions,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled {
                reason: CancelReason::Token,
            });
        }
        let timeout = options
            .timeout
            .or_else(|| self.inner.settings.call_timeout());
        let call = async {
            let waiter = self.dispatch_call(method, params, options).await?;
            waiter.wait_as(cancel).await
        };
        // Dropping `call` releases the send and the pending slot.
        tokio::select! {
            biased;
            result = call => result,
            () = cancel.cancelled() => Err(RelayError::Cancelled { reason: CancelReason::Token }),
            () = sleep_or_forever(timeout) => Err(RelayError::Cancelled {
                reason: CancelReason::Deadline(timeout.unwrap_or_default()),
            }),
        }
    }

    /// Send a request without waiting for its response.
    pub async fn dispatch_call<P>(
        &self,
        method: &str,
        params: &P,
        options: CallOptions,
    ) -> Result<ResponseWaiter>
    where
        P: Serialize + ?Sized,
    {
        let params = to_params(params)?;
        self.ensure_open()?;

        let call = match options.id {
            Some(id) => self.inner.pending.register(id)?,
            None => self.register_next()?,
        };
        let request = Request {
            id: call.id().clone(),
            method: method.to_owned(),
            params,
            meta: options.meta,
        };
        self.send(Envelope::Request(request)).await?;

        Ok(ResponseWaiter {
            call,
            timeout: options.timeout.or_else(|| self.inner.settings.call_timeout()),
        })
    }

    fn register_next(&self) -> Result<PendingCall> {
        loop {
            let id = RequestId::Num(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
            match self.inner.pending.register(id) {
                Err(RelayError::DuplicateId { .. }) => {}
                other => return other,
            }
        }
    }

    // ── Notifications ──

    /// Send a notification.
    pub async fn notify<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<()> {
        self.send_notification(method, to_params(params)?, None).await
    }

    /// [`Connection::notify`], giving up when `cancel` fires.
    pub async fn notify_with_cancel<P: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: &P,
    ) -> Result<()> {
        let params = to_params(params)?;
        until_cancelled(cancel, self.send_notification(method, params, None)).await
    }

    /// Send a notification carrying metadata.
    pub async fn notify_with_meta<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
        meta: Payload,
    ) -> Result<()> {
        self.send_notification(method, to_params(params)?, Some(meta))
            .await
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Payload>,
        meta: Option<Payload>,
    ) -> Result<()> {
        self.ensure_open()?;
        let notification = Notification {
            method: method.to_owned(),
            params,
            meta,
        };
        self.send(Envelope::Notification(notification)).await
    }

    // ── Replies ──

    /// Answer inbound request `id` with a result.
    pub async fn reply<R: Serialize + ?Sized>(&self, id: &RequestId, result: &R) -> Result<()> {
        let result = Payload::from_value(result).map_err(RelayError::InvalidPayload)?;
        self.send_response(Response::success(id.clone(), result))
            .await
    }

    /// [`Connection::reply`], giving up when `cancel` fires.
    ///
    /// A send abandoned after it started still counts as the reply.
    pub async fn reply_with_cancel<R: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        id: &RequestId,
        result: &R,
    ) -> Result<()> {
        let result = Payload::from_value(result).map_err(RelayError::InvalidPayload)?;
        until_cancelled(cancel, self.send_response(Response::success(id.clone(), result))).await
    }

    /// Answer inbound request `id` with an error.
    pub async fn reply_with_error(&self, id: &RequestId, error: ErrorObject) -> Result<()> {
        self.send_response(Response::error(Some(id.clone()), error))
            .await
    }

    /// [`Connection::reply_with_error`], giving up when `cancel` fires.
    pub async fn reply_with_error_with_cancel(
        &self,
        cancel: &CancellationToken,
        id: &RequestId,
        error: ErrorObject,
    ) -> Result<()> {
        until_cancelled(
            cancel,
            self.send_response(Response::error(Some(id.clone()), error)),
        )
        .await
    }

    /// Send a prepared response.
    ///
    /// Each dispatched request may be answered once; a second answer, or one
    /// for an id never received, fails with [`RelayError::DoubleReply`]. A
    /// response without an id is sent as-is.
    pub async fn send_response(&self, response: Response) -> Result<()> {
        self.ensure_open()?;
        if let Some(id) = &response.id {
            if !self.inner.replies.complete(id) {
                return Err(RelayError::DoubleReply { id: id.clone() });
            }
        }
        self.send(Envelope::Response(response)).await
    }

    // ── Shutdown ──

    /// Begin closing: fail pending calls and close the stream. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.begin_close(CloseReason::Local) {
            return Ok(());
        }
        let cancelled = self.inner.pending.cancel_all(CloseReason::Local);
        debug!(connection = %self.inner.name, cancelled, "closing");
        self.inner.stream.close().await?;
        Ok(())
    }

    // ── Internals ──

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ConnectionState::Open {
            Ok(())
        } else {
            Err(RelayError::ConnectionClosed)
        }
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        for observer in &self.inner.observers {
            observer.on_send(&envelope);
        }
        // A send still in flight when the connection leaves `Open` is abandoned.
        let sent = tokio::select! {
            biased;
            sent = self.inner.stream.send(&envelope) => sent,
            () = self.inner.cancel.cancelled() => Err(TransportError::Closed),
        };
        match sent {
            Ok(()) => Ok(()),
            Err(TransportError::Encode(e)) => Err(RelayError::InvalidPayload(e)),
            Err(TransportError::Closed) => Err(RelayError::ConnectionClosed),
            Err(e) => {
                warn!(connection = %self.inner.name, error = %e, "send failed, closing");
                if self.inner.begin_close(CloseReason::SendFailed(e.to_string())) {
                    let _ = self
                        .inner
                        .pending
                        .cancel_all(CloseReason::SendFailed(e.to_string()));
                    if let Err(close_err) = self.inner.stream.close().await {
                        debug!(error = %close_err, "stream close failed");
                    }
                }
                Err(RelayError::Transport(e))
            }
        }
    }

    fn report(&self, error: &ProtocolError) {
        for observer in &self.inner.observers {
            observer.on_protocol_error(error);
        }
    }

    async fn route(&self, envelope: Envelope) {
        for observer in &self.inner.observers {
            observer.on_receive(&envelope);
        }
        match envelope {
            Envelope::Response(response) => match response.id.clone() {
                Some(id) => {
                    if !self.inner.pending.resolve(&id, response) {
                        self.report(&ProtocolError::UnmatchedResponse { id });
                    }
                }
                None => match response.result {
                    Err(error) => self.report(&ProtocolError::OrphanError { error }),
                    Ok(_) => self.report(&ProtocolError::malformed(
                        "success response without id",
                        "",
                    )),
                },
            },
            Envelope::Request(request) => {
                if !self.inner.replies.track(request.id.clone()) {
                    self.report(&ProtocolError::DuplicateInboundId {
                        id: request.id.clone(),
                    });
                }
                self.dispatch(Incoming::Request(request)).await;
            }
            Envelope::Notification(notification) => {
                self.dispatch(Incoming::Notification(notification)).await;
            }
        }
    }

    async fn dispatch(&self, incoming: Incoming) {
        let handler = Arc::clone(&self.inner.handler);
        let cancel = self.inner.cancel.clone();
        let conn = self.clone();
        let method = incoming.method().to_owned();
        let task = tokio::spawn(
            async move { handler.handle(cancel, conn, incoming).await }
                .instrument(tracing::Span::current()),
        );

        match self.inner.settings.dispatch_mode {
            DispatchMode::Async => {
                let _ = tokio::spawn(
                    async move { log_handler_failure(&method, task.await) }
                        .instrument(tracing::Span::current()),
                );
            }
            DispatchMode::Sync => {
                tokio::select! {
                    joined = task => log_handler_failure(&method, joined),
                    // Leave a stuck handler running so shutdown can proceed.
                    () = self.inner.cancel.cancelled() => {}
                }
            }
        }
    }

    async fn reply_malformed(&self, error: &ProtocolError) {
        let response = Response::error(None, ErrorObject::parse_error(error.to_string()));
        if let Err(e) = self.send(Envelope::Response(response)).await {
            debug!(error = %e, "could not answer malformed message");
        }
    }

    async fn finish(&self, reason: CloseReason) {
        let _ = self.inner.begin_close(reason);
        let reason = self.close_reason().unwrap_or(CloseReason::Local);

        let cancelled = self.inner.pending.cancel_all(reason.clone());
        let unanswered = self.inner.replies.clear();
        if let Err(e) = self.inner.stream.close().await {
            debug!(error = %e, "stream close failed");
        }

        self.inner.state.lock().state = ConnectionState::Closed;
        for observer in &self.inner.observers {
            observer.on_closed(&reason);
        }
        info!(%reason, cancelled, unanswered, "connection closed");
        self.inner.disconnected.cancel();
    }
}

impl Inner {
    /// `Open → Closing`. Returns false if already past `Open`.
    fn begin_close(&self, reason: CloseReason) -> bool {
        {
            let mut cell = self.state.lock();
            if cell.state != ConnectionState::Open {
                return false;
            }
            cell.state = ConnectionState::Closing;
            cell.reason = Some(reason);
        }
        self.cancel.cancel();
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

async fn until_cancelled<F>(cancel: &CancellationToken, op: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(RelayError::Cancelled { reason: CancelReason::Token }),
        done = op => done,
    }
}

fn log_handler_failure(method: &str, joined: std::result::Result<(), JoinError>) {
    if let Some(e) = joined.err().filter(JoinError::is_panic) {
        error!(method = %method, error = %e, "handler panicked");
    }
}

fn to_params<P: Serialize + ?Sized>(params: &P) -> Result<Option<Payload>> {
    let payload = Payload::from_value(params).map_err(RelayError::InvalidPayload)?;
    Ok((!payload.is_null()).then_some(payload))
}

async fn read_loop(conn: Connection) {
    debug!("read loop started");
    let reason = loop {
        let received = tokio::select! {
            biased;
            () = conn.inner.cancel.cancelled() => break CloseReason::Local,
            received = conn.inner.stream.receive() => received,
        };
        match received {
            Ok(envelope) => conn.route(envelope).await,
            Err(ReceiveError::Protocol(error)) => {
                conn.report(&error);
                if conn.inner.settings.reply_to_malformed
                    && matches!(error, ProtocolError::Malformed { .. })
                {
                    conn.reply_malformed(&error).await;
                }
            }
            Err(ReceiveError::EndOfStream) => break CloseReason::EndOfStream,
            Err(ReceiveError::Transport(e)) => break CloseReason::Transport(e.to_string()),
        }
    };
    conn.finish(reason).await;
}
