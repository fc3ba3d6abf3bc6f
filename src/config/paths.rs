//! Filesystem locations resolved with the `dirs` crate.
//!
//! Layout (Linux):
//!
//! ```text
//! ~/.config/autorain/settings.toml     configuration
//! ```
//!
//! The first command-line argument or `AUTORAIN_CONFIG` overrides the
//! settings file location.

use std::path::PathBuf;

/// Environment variable that overrides [`AppPaths::settings_file`].
pub const CONFIG_ENV: &str = "AUTORAIN_CONFIG";

/// Holds all resolved application directory/file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory holding `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "autorain";

    /// Resolves all paths using the `dirs` crate, falling back to the
    /// current directory when the platform cannot provide one.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let settings_file = config_dir.join("settings.toml");

        Self {
            config_dir,
            settings_file,
        }
    }

    /// Settings file to load: explicit argument, then `AUTORAIN_CONFIG`,
    /// then the platform default.
    pub fn resolve_settings(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| Self::new().settings_file)
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
