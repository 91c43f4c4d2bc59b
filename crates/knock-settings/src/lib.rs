//! # knock-settings
//!
//! Settings for the knock relay, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`KnockSettings::default()`]
//! 2. **User file**: `~/.knock/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `KNOCK_*` overrides
//!
//! Command-line flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, knock_dir, load_settings_from_path, parse_level, settings_path,
};
pub use types::*;
