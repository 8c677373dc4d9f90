//! Shared foundations for the Decenza device core.
//!
//! This crate carries the pieces every engine needs and none owns:
//!
//! - [`env`]: the [`env::Environment`] abstraction over time and randomness,
//!   so drivers and engines can run under a deterministic clock in tests.
//! - [`value`]: the closed [`value::Value`] kind enum used by the settings
//!   store and layout/theme dictionaries, with soft-failing typed accessors.
//! - [`settings`]: the JSON-file-backed key/value store with
//!   signal-on-change semantics and a sensitive-key export filter.
//! - [`paths`]: explicit platform services (data/cache/download roots)
//!   passed through construction instead of looked up globally.

pub mod env;
pub mod paths;
pub mod settings;
pub mod value;

pub use env::{Environment, SystemEnv};
pub use paths::PlatformServices;
pub use settings::{SettingChanged, SettingsError, SettingsStore};
pub use value::Value;
