//! Configuration module.
//!
//! Provides `AppConfig` (top-level settings), one sub-config per subsystem,
//! `AppPaths` for the settings location, and TOML loading via
//! `AppConfig::load_from`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AppConfig, AudioConfig, BluetoothConfig, BtStrategy, ClipNames, LedConfig, LoggingConfig,
    RetryConfig, SystemConfig, ToolConfig,
};
