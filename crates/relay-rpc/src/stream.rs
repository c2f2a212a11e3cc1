//! Message-oriented transports carrying one envelope per message.

use async_trait::async_trait;
use relay_core::errors::{ProtocolError, TransportError};
use relay_core::wire::{self, Envelope};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Why [`ObjectStream::receive`] produced no envelope.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The peer closed the stream, or it was closed locally.
    #[error("end of stream")]
    EndOfStream,
    /// The transport failed; no further messages will arrive.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// One message could not be decoded; the stream is still usable.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A full-duplex stream of JSON-RPC envelopes.
///
/// Implementations serialize concurrent `send` calls in arrival order and
/// allow `send` to run concurrently with `receive`. Only one task calls
/// `receive` at a time. `close` is idempotent and makes a pending `receive`
/// return [`ReceiveError::EndOfStream`].
#[async_trait]
pub trait ObjectStream: Send + Sync + 'static {
    /// Encode and write one envelope.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Read and decode the next envelope.
    async fn receive(&self) -> Result<Envelope, ReceiveError>;

    /// Close the stream.
    async fn close(&self) -> Result<(), TransportError>;
}

/// In-process stream over tokio channels carrying encoded text.
///
/// Created in connected pairs by [`MemoryObjectStream::pair`]. Closing one
/// end delivers end-of-stream to the other.
pub struct MemoryObjectStream {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
}

impl MemoryObjectStream {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: mpsc::UnboundedSender<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Write text as-is, without encoding or validation.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.tx.lock().await;
        let tx = tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text.into()).map_err(|_| TransportError::UnexpectedEof)
    }

    /// Read the next message as text, without decoding.
    pub async fn receive_raw(&self) -> Result<String, ReceiveError> {
        if self.closed.is_cancelled() {
            return Err(ReceiveError::EndOfStream);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(ReceiveError::EndOfStream),
            msg = rx.recv() => msg.ok_or(ReceiveError::EndOfStream),
        }
    }
}

#[async_trait]
impl ObjectStream for MemoryObjectStream {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = wire::encode(envelope)?;
        self.send_raw(text).await
    }

    async fn receive(&self) -> Result<Envelope, ReceiveError> {
        let text = self.receive_raw().await?;
        Ok(wire::decode(&text)?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        drop(self.tx.lock().await.take());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use relay_core::wire::{Notification, Payload};

    fn notification(method: &str) -> Envelope {
        Envelope::Notification(Notification::new(
            method,
            Some(Payload::from_value(&[1, 2]).unwrap()),
        ))
    }

    #[tokio::test]
    async fn pair_carries_envelopes_both_ways() {
        let (a, b) = MemoryObjectStream::pair();
        a.send(&notification("a->b")).await.unwrap();
        b.send(&notification("b->a")).await.unwrap();

        assert_eq!(b.receive().await.unwrap().method(), Some("a->b"));
        assert_eq!(a.receive().await.unwrap().method(), Some("b->a"));
    }

    #[tokio::test]
    async fn sends_arrive_in_order() {
        let (a, b) = MemoryObjectStream::pair();
        for i in 0..20 {
            a.send(&notification(&format!("m{i}"))).await.unwrap();
        }
        for i in 0..20 {
            assert_eq!(b.receive().await.unwrap().method(), Some(format!("m{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn encoded_text_is_visible_raw() {
        let (a, b) = MemoryObjectStream::pair();
        a.send(&notification("m")).await.unwrap();
        assert_eq!(
            b.receive_raw().await.unwrap(),
            r#"{"jsonrpc":"2.0","method":"m","params":[1,2]}"#
        );
    }

    #[tokio::test]
    async fn malformed_text_is_a_protocol_error() {
        let (a, b) = MemoryObjectStream::pair();
        a.send_raw("{oops").await.unwrap();
        a.send(&notification("after")).await.unwrap();

        assert_matches!(b.receive().await, Err(ReceiveError::Protocol(ProtocolError::Malformed { .. })));
        assert_eq!(b.receive().await.unwrap().method(), Some("after"));
    }

    #[tokio::test]
    async fn close_ends_both_sides() {
        let (a, b) = MemoryObjectStream::pair();
        a.close().await.unwrap();

        assert_matches!(b.receive().await, Err(ReceiveError::EndOfStream));
        assert_matches!(a.receive().await, Err(ReceiveError::EndOfStream));
        assert_matches!(a.send(&notification("late")).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = MemoryObjectStream::pair();
        a.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_pending_receive() {
        let (a, _b) = MemoryObjectStream::pair();
        let a = std::sync::Arc::new(a);
        let reader = tokio::spawn({
            let a = a.clone();
            async move { a.receive().await }
        });
        tokio::task::yield_now().await;
        a.close().await.unwrap();
        assert_matches!(reader.await.unwrap(), Err(ReceiveError::EndOfStream));
    }

    #[tokio::test]
    async fn send_to_dropped_peer_fails() {
        let (a, b) = MemoryObjectStream::pair();
        drop(b);
        assert_matches!(a.send(&notification("x")).await, Err(TransportError::UnexpectedEof));
    }
}
