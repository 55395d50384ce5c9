//! Layered configuration: compiled defaults, then `~/.loom/settings.json`,
//! then `LOOM_*` environment variables.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
