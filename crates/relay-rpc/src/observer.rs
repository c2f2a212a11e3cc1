//! Hooks for watching a connection's traffic and anomalies.
//!
//! Protocol anomalies (unmatched responses, malformed input, reused inbound
//! ids) never fail the connection. They are reported here and nowhere else.

use relay_core::errors::ProtocolError;
use relay_core::wire::Envelope;
use tracing::{debug, warn};

use crate::connection::CloseReason;

/// Receives connection events. Every method has a default.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// An envelope is about to be written.
    fn on_send(&self, _envelope: &Envelope) {}

    /// An envelope was read.
    fn on_receive(&self, _envelope: &Envelope) {}

    /// The peer violated the protocol. Logs a warning unless overridden.
    fn on_protocol_error(&self, error: &ProtocolError) {
        warn!(error = %error, "protocol error");
    }

    /// The connection reached `Closed`.
    fn on_closed(&self, _reason: &CloseReason) {}
}

/// Observer with only the default behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultObserver;

impl ConnectionObserver for DefaultObserver {}

/// Logs every envelope at debug level.
///
/// Installed alongside the primary observer when `logMessages` is set.
#[derive(Clone, Debug)]
pub struct TracingObserver {
    connection: String,
}

impl TracingObserver {
    /// Observer labelling its events with `connection`.
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
        }
    }

    fn log(&self, direction: &str, envelope: &Envelope) {
        let id = envelope.id().map(ToString::to_string);
        debug!(
            connection = %self.connection,
            kind = envelope.kind(),
            id = id.as_deref(),
            method = envelope.method(),
            "{direction}"
        );
    }
}

impl ConnectionObserver for TracingObserver {
    fn on_send(&self, envelope: &Envelope) {
        self.log("-->", envelope);
    }

    fn on_receive(&self, envelope: &Envelope) {
        self.log("<--", envelope);
    }

    // The primary observer reports anomalies.
    fn on_protocol_error(&self, _error: &ProtocolError) {}
}
