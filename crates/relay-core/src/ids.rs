//! JSON-RPC request identifiers.
//!
//! A [`RequestId`] is either an unsigned integer or a string. Outbound calls
//! use numbers handed out by the connection; peers (and callers picking their
//! own ids) may use either form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation token carried by a request and echoed by its response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id (`"id": 7`).
    Num(u64),
    /// String id (`"id": "abc"`).
    Str(String),
}

impl RequestId {
    /// Whether this is a string id.
    pub fn is_string(&self) -> bool {
        matches!(self, Self::Str(_))
    }
}

/// Numbers print bare, strings print quoted, so `7` and `"7"` stay distinguishable in logs.
impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Num(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}
