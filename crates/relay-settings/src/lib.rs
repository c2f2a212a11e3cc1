//! # relay-settings
//!
//! Connection configuration with layered sources.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: a JSON document deep-merged over the defaults
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! There is no process-wide instance. Load once and hand the value to each
//! connection explicitly.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::*;
