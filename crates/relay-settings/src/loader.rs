//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `RELAY_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{DispatchMode, RelaySettings};

/// Longest accepted `RELAY_CALL_TIMEOUT_MS` (one hour).
const MAX_CALL_TIMEOUT_MS: u64 = 3_600_000;
/// Accepted range for the WebSocket size limits.
const WS_SIZE_RANGE: (usize, usize) = (1024, 1 << 30);

/// Compiled defaults with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    let mut settings = RelaySettings::default();
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Load settings from a JSON file with env var overrides.
///
/// If the file does not exist, returns defaults (plus overrides). Invalid
/// JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` environment variable overrides.
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
fn apply_overrides_from(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Connection settings ─────────────────────────────────────────
    if let Some(v) = env.parsed("RELAY_DISPATCH_MODE", "dispatch mode", parse_dispatch_mode) {
        settings.connection.dispatch_mode = v;
    }
    if let Some(v) = env.parsed("RELAY_CALL_TIMEOUT_MS", "u64", |s| {
        parse_u64_range(s, 1, MAX_CALL_TIMEOUT_MS)
    }) {
        settings.connection.call_timeout_ms = Some(v);
    }
    if let Some(v) = env.parsed("RELAY_REPLY_TO_MALFORMED", "boolean", parse_bool) {
        settings.connection.reply_to_malformed = v;
    }
    if let Some(v) = env.parsed("RELAY_LOG_MESSAGES", "boolean", parse_bool) {
        settings.connection.log_messages = v;
    }
    if let Some(v) = env.string("RELAY_CONNECTION_NAME") {
        settings.connection.name = Some(v);
    }

    // ── WebSocket settings ──────────────────────────────────────────
    let (min, max) = WS_SIZE_RANGE;
    if let Some(v) = env.parsed("RELAY_WS_MAX_MESSAGE_SIZE", "usize", |s| {
        parse_usize_range(s, min, max)
    }) {
        settings.websocket.max_message_size = v;
    }
    if let Some(v) = env.parsed("RELAY_WS_MAX_FRAME_SIZE", "usize", |s| {
        parse_usize_range(s, min, max)
    }) {
        settings.websocket.max_frame_size = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a dispatch mode name (`sync` / `async`, case-insensitive).
pub fn parse_dispatch_mode(val: &str) -> Option<DispatchMode> {
    match val.to_lowercase().as_str() {
        "sync" | "synchronous" => Some(DispatchMode::Sync),
        "async" | "asynchronous" => Some(DispatchMode::Async),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Variable readers ────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
