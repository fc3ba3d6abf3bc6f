//! Application settings structs, defaults and TOML loading.
//!
//! Every section implements `Default` with the values the rig ships with, and
//! is tagged `#[serde(default)]` so a settings file only needs the keys it
//! wants to change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ToolConfig
// ---------------------------------------------------------------------------

/// How the provisioning tool is launched and paced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Program and arguments, e.g. `["sudo", "palera1n", "-l"]`.
    pub command: Vec<String>,
    /// Seconds to wait for the next recognised signal before the session is
    /// considered hung.
    pub inactivity_timeout_secs: u64,
    /// Minimum length of the "hold home + power" cue before the DFU
    /// keystroke is sent.
    pub dfu_hold_secs: f32,
    /// Minimum length of the "hold home" cue after the DFU keystroke.
    pub dfu_release_secs: f32,
    /// Minimum length of the "plug in the device" cue.
    pub waiting_dwell_secs: f32,
    /// Extra environment for the tool process.
    pub env: Vec<(String, String)>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: vec!["sudo".into(), "palera1n".into(), "-l".into()],
            inactivity_timeout_secs: 300,
            dfu_hold_secs: 5.0,
            dfu_release_secs: 10.0,
            waiting_dwell_secs: 2.5,
            env: Vec::new(),
        }
    }
}

impl ToolConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Bounded-retry policy for tool sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; total spawns = `max_retries + 1`.
    pub max_retries: u32,
    /// Pause between a failed attempt and the next spawn.
    pub respawn_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            respawn_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// File names of the spoken cues, relative to [`AudioConfig::clip_dir`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipNames {
    pub ready: String,
    pub step1: String,
    pub step2: String,
    pub complete: String,
    pub retry: String,
    pub shutdown: String,
}

impl Default for ClipNames {
    fn default() -> Self {
        Self {
            ready: "ready.mp3".into(),
            step1: "step1.mp3".into(),
            step2: "step2.mp3".into(),
            complete: "complete.mp3".into(),
            retry: "retry.mp3".into(),
            shutdown: "shutdown.mp3".into(),
        }
    }
}

/// Audio playback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Set to `false` to run silently (LED feedback only).
    pub enabled: bool,
    /// Player binary; invoked as `<player> -q <file>`.
    pub player: String,
    /// Directory containing the clips.
    pub clip_dir: PathBuf,
    pub clips: ClipNames,
    /// Value exported as `PULSE_SERVER` for the player and `pactl`.
    pub pulse_server: Option<String>,
    /// Sink volume applied once the speaker connects.
    pub volume_percent: u8,
    /// How long to wait for the Bluetooth sink to appear in PulseAudio.
    pub sink_wait_secs: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            player: "mpg123".into(),
            clip_dir: PathBuf::from("/home/orangepi"),
            clips: ClipNames::default(),
            pulse_server: Some("unix:/run/user/1000/pulse/native".into()),
            volume_percent: 2,
            sink_wait_secs: 4.0,
        }
    }
}

// ---------------------------------------------------------------------------
// BluetoothConfig
// ---------------------------------------------------------------------------

/// Which recovery variant the boot sequence starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BtStrategy {
    /// Block boot until connected or `startup_timeout_secs`, then hand over
    /// to the background loop.
    Blocking,
    /// Never block boot; recover entirely in the background.
    Background,
}

impl Default for BtStrategy {
    fn default() -> Self {
        Self::Blocking
    }
}

/// Speaker link and power-relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub enabled: bool,
    /// MAC address of the speaker.
    pub device: String,
    /// Script that toggles the speaker's power relay.
    pub power_script: String,
    /// Run the power script through `sudo`.
    pub use_sudo: bool,
    pub strategy: BtStrategy,
    /// Overall bound of the blocking variant.
    pub startup_timeout_secs: u64,
    /// Bound of a single background round.
    pub background_timeout_secs: u64,
    /// Pause between background rounds.
    pub retry_interval_secs: u64,
    /// Time the speaker needs after power-on before it accepts connections.
    pub boot_settle_secs: f32,
    /// Connect attempts per power-cycle round.
    pub rapid_attempts: u32,
    /// Pause between rapid connect attempts.
    pub attempt_delay_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "11:81:AA:11:88:72".into(),
            power_script: "/usr/local/bin/speaker-power.sh".into(),
            use_sudo: true,
            strategy: BtStrategy::default(),
            startup_timeout_secs: 30,
            background_timeout_secs: 20,
            retry_interval_secs: 6,
            boot_settle_secs: 3.0,
            rapid_attempts: 5,
            attempt_delay_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// LedConfig
// ---------------------------------------------------------------------------

/// RGB status LED wiring and PWM timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    pub enabled: bool,
    /// Abort boot when the GPIO chip cannot be opened instead of running
    /// without LEDs.
    pub required: bool,
    pub gpio_chip: String,
    /// Line offsets per LED as `[r, g, b]`, closest to the Ethernet jack
    /// first.
    pub pins: Vec<[u32; 3]>,
    /// Software PWM period in microseconds.
    pub pwm_period_us: u64,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            gpio_chip: "/dev/gpiochip1".into(),
            pins: vec![[232, 75, 71], [230, 74, 233], [69, 73, 72]],
            pwm_period_us: 1_000,
        }
    }
}

impl LedConfig {
    pub fn pwm_period(&self) -> Duration {
        Duration::from_micros(self.pwm_period_us.max(1))
    }
}

// ---------------------------------------------------------------------------
// SystemConfig
// ---------------------------------------------------------------------------

/// Host integration: lease, usbmuxd, shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub lease_file: PathBuf,
    /// Substring of `/proc/<pid>/cmdline` that identifies a live instance.
    pub lease_marker: String,
    pub shutdown_command: Vec<String>,
    /// Log the shutdown instead of executing it.
    pub dry_run: bool,
    /// Restart usbmuxd before the first tool run.
    pub usbmuxd_enabled: bool,
    pub usbmuxd_command: Vec<String>,
    pub usbmuxd_log: Option<PathBuf>,
    pub usbmuxd_socket: PathBuf,
    /// Process names reaped on teardown.
    pub reap_names: Vec<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            lease_file: PathBuf::from("/tmp/autorain.pid"),
            lease_marker: "autorain".into(),
            shutdown_command: vec!["/usr/sbin/poweroff".into()],
            dry_run: false,
            usbmuxd_enabled: true,
            usbmuxd_command: vec![
                "sudo".into(),
                "/usr/sbin/usbmuxd".into(),
                "-f".into(),
                "-p".into(),
                "-v".into(),
            ],
            usbmuxd_log: Some(PathBuf::from("/home/orangepi/autorain-usbmuxd.txt")),
            usbmuxd_socket: PathBuf::from("/var/run/usbmuxd"),
            reap_names: vec!["palera1n".into(), "usbmuxd".into()],
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Append-only log file mirrored from stdout. `None` logs to stdout only.
    pub file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use autorain::config::{AppConfig, AppPaths};
///
/// let config = AppConfig::load_from(&AppPaths::resolve_settings(None)).unwrap();
/// assert!(config.retry.max_retries > 0);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tool: ToolConfig,
    pub retry: RetryConfig,
    pub audio: AudioConfig,
    pub bluetooth: BluetoothConfig,
    pub leds: LedConfig,
    pub system: SystemConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        let default = AppConfig::default();

        assert_eq!(config.tool.command, default.tool.command);
        assert_eq!(config.retry.max_retries, default.retry.max_retries);
        assert_eq!(config.leds.pins, default.leds.pins);
    }

    #[test]
    fn default_values_match_rig() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.tool.command, vec!["sudo", "palera1n", "-l"]);
        assert_eq!(cfg.tool.inactivity_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.leds.pins.len(), 3);
        assert_eq!(cfg.leds.pwm_period(), Duration::from_millis(1));
        assert_eq!(cfg.bluetooth.strategy, BtStrategy::Blocking);
        assert_eq!(cfg.bluetooth.startup_timeout_secs, 30);
        assert_eq!(cfg.system.lease_file, PathBuf::from("/tmp/autorain.pid"));
        assert!(cfg.logging.file.is_none());
    }

    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let mut cfg = AppConfig::default();
        cfg.retry.max_retries = 5;
        cfg.bluetooth.strategy = BtStrategy::Background;
        cfg.system.usbmuxd_enabled = false;
        cfg.logging.file = Some(PathBuf::from("/var/log/autorain.log"));

        std::fs::write(&path, toml::to_string_pretty(&cfg).expect("serialise")).expect("write");
        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(loaded.retry.max_retries, 5);
        assert_eq!(loaded.bluetooth.strategy, BtStrategy::Background);
        assert!(!loaded.system.usbmuxd_enabled);
        assert_eq!(
            loaded.logging.file,
            Some(PathBuf::from("/var/log/autorain.log"))
        );
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[retry]\nmax_retries = 1\n\n[bluetooth]\nstrategy = \"background\"\n",
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).expect("load");
        assert_eq!(cfg.retry.max_retries, 1);
        assert_eq!(cfg.retry.respawn_delay_ms, 2_000);
        assert_eq!(cfg.bluetooth.strategy, BtStrategy::Background);
        assert_eq!(cfg.bluetooth.device, "11:81:AA:11:88:72");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[retry\nmax_retries = ").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }
}
