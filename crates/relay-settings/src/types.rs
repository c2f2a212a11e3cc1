//! Settings types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Default WebSocket message size limit (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 << 20;
/// Default WebSocket frame size limit (4 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 << 20;

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Connection behavior.
    pub connection: ConnectionSettings,
    /// WebSocket transport limits.
    pub websocket: WebSocketSettings,
}

impl RelaySettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.connection.call_timeout_ms == Some(0) {
            return Err(SettingsError::InvalidValue(
                "connection.callTimeoutMs must be positive".into(),
            ));
        }
        if self.websocket.max_message_size == 0 || self.websocket.max_frame_size == 0 {
            return Err(SettingsError::InvalidValue(
                "websocket size limits must be positive".into(),
            ));
        }
        if self.websocket.max_frame_size > self.websocket.max_message_size {
            return Err(SettingsError::InvalidValue(format!(
                "websocket.maxFrameSize ({}) exceeds maxMessageSize ({})",
                self.websocket.max_frame_size, self.websocket.max_message_size
            )));
        }
        Ok(())
    }
}

/// How the read loop runs handlers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Await each handler before reading the next message.
    #[default]
    Sync,
    /// Spawn each handler invocation as its own task.
    Async,
}

/// Per-connection behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Handler dispatch mode.
    pub dispatch_mode: DispatchMode,
    /// Default deadline for outbound calls, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
    /// Answer undecodable messages with a `-32700` error response.
    pub reply_to_malformed: bool,
    /// Log every envelope sent and received at debug level.
    pub log_messages: bool,
    /// Label used in logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConnectionSettings {
    /// The default call deadline, if configured.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Sync,
            call_timeout_ms: None,
            reply_to_malformed: true,
            log_messages: false,
            name: None,
        }
    }
}

/// WebSocket transport limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketSettings {
    /// Largest accepted message, in bytes.
    pub max_message_size: usize,
    /// Largest accepted frame, in bytes.
    pub max_frame_size: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.connection.dispatch_mode, DispatchMode::Sync);
        assert!(s.connection.call_timeout_ms.is_none());
        assert!(s.connection.reply_to_malformed);
        assert!(!s.connection.log_messages);
        assert_eq!(s.websocket.max_message_size, 16 * 1024 * 1024);
        assert_eq!(s.websocket.max_frame_size, 4 * 1024 * 1024);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert_eq!(json["connection"]["dispatchMode"], "sync");
        assert_eq!(json["connection"]["replyToMalformed"], true);
        assert!(json["connection"].get("callTimeoutMs").is_none());
        assert_eq!(json["websocket"]["maxFrameSize"], 4_194_304);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"connection":{"dispatchMode":"async","callTimeoutMs":500}}"#)
                .unwrap();
        assert_eq!(s.connection.dispatch_mode, DispatchMode::Async);
        assert_eq!(s.connection.call_timeout(), Some(Duration::from_millis(500)));
        assert!(s.connection.reply_to_malformed);
        assert_eq!(s.websocket, WebSocketSettings::default());
    }

    #[test]
    fn unknown_dispatch_mode_rejected() {
        let result = serde_json::from_str::<ConnectionSettings>(r#"{"dispatchMode":"parallel"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut s = RelaySettings::default();
        s.connection.call_timeout_ms = Some(0);
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn validate_rejects_frame_larger_than_message() {
        let mut s = RelaySettings::default();
        s.websocket.max_frame_size = s.websocket.max_message_size + 1;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("maxFrameSize"));
    }
}
