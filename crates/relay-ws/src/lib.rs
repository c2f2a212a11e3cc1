//! # relay-ws
//!
//! [`ObjectStream`] over a `tokio-tungstenite` WebSocket: one JSON-RPC
//! envelope per WebSocket message.
//!
//! Use [`connect`] on the client side and [`accept`] on the server side, then
//! hand the stream to [`relay_rpc::Connection::builder`].

#![deny(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::errors::{ProtocolError, TransportError};
use relay_core::wire::{self, Envelope};
use relay_rpc::{ObjectStream, ReceiveError};
use relay_settings::WebSocketSettings;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long [`ObjectStream::close`] waits to flush the Close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Client-side stream type returned by [`connect`].
pub type ClientStream = WebSocketObjectStream<MaybeTlsStream<TcpStream>>;

/// A WebSocket carrying one encoded envelope per message.
///
/// Sends are serialized behind a lock; receiving runs concurrently with
/// sending. Outbound messages are Text frames. Closing aborts a send stuck
/// on backpressure.
pub struct WebSocketObjectStream<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    closed: CancellationToken,
}

impl<S> WebSocketObjectStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
        }
    }

    async fn next_text(&self) -> Result<String, ReceiveError> {
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(ReceiveError::EndOfStream),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec()).map_err(|_| {
                        ProtocolError::InvalidFrame {
                            reason: "binary message is not valid UTF-8".into(),
                        }
                        .into()
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "peer sent close frame");
                    return Err(ReceiveError::EndOfStream);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => return Err(receive_error(e)),
                None => return Err(ReceiveError::EndOfStream),
            }
        }
    }
}

#[async_trait]
impl<S> ObjectStream for WebSocketObjectStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let text = wire::encode(envelope)?;
        let mut sink = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(TransportError::Closed),
            sink = self.sink.lock() => sink,
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::Closed),
            sent = sink.send(Message::Text(text.into())) => sent.map_err(send_error),
        }
    }

    async fn receive(&self) -> Result<Envelope, ReceiveError> {
        if self.closed.is_cancelled() {
            return Err(ReceiveError::EndOfStream);
        }
        let text = self.next_text().await?;
        Ok(wire::decode(&text)?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        // Closing the sink sends the Close frame. A peer that stopped reading
        // never lets it flush.
        let closing = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(CLOSE_GRACE, closing).await {
            Ok(Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Ok(()),
            Ok(Err(e)) => {
                debug!(error = %e, "websocket close failed");
                Err(send_error(e))
            }
            Err(_) => {
                debug!("close frame not flushed, peer is not reading");
                Ok(())
            }
        }
    }
}

/// Open a client WebSocket to `url`.
pub async fn connect(url: &str, settings: &WebSocketSettings) -> Result<ClientStream, TransportError> {
    let (ws, response) =
        tokio_tungstenite::connect_async_with_config(url, Some(ws_config(settings)), true)
            .await
            .map_err(send_error)?;
    info!(url, status = response.status().as_u16(), "websocket connected");
    Ok(WebSocketObjectStream::new(ws))
}

/// Complete the server side of a WebSocket handshake on an accepted socket.
pub async fn accept<S>(socket: S, settings: &WebSocketSettings) -> Result<WebSocketObjectStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async_with_config(socket, Some(ws_config(settings)))
        .await
        .map_err(send_error)?;
    debug!("websocket accepted");
    Ok(WebSocketObjectStream::new(ws))
}

fn ws_config(settings: &WebSocketSettings) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(settings.max_message_size))
        .max_frame_size(Some(settings.max_frame_size))
}

fn send_error(error: WsError) -> TransportError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::UnexpectedEof
        }
        WsError::Io(e) => TransportError::Io(e),
        other => TransportError::WebSocket(other.to_string()),
    }
}

fn receive_error(error: WsError) -> ReceiveError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ReceiveError::EndOfStream,
        other => ReceiveError::Transport(send_error(other)),
    }
}
