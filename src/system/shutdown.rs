//! Irreversible host power-off.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::SystemConfig;

pub trait Shutdown: Send + Sync {
    fn power_off(&self);
}

/// Runs the configured power-off command, or only logs it in dry-run mode.
#[derive(Debug, Clone)]
pub struct CommandShutdown {
    command: Vec<String>,
    dry_run: bool,
}

impl CommandShutdown {
    pub fn new(cfg: &SystemConfig) -> Self {
        Self {
            command: cfg.shutdown_command.clone(),
            dry_run: cfg.dry_run,
        }
    }
}

impl Shutdown for CommandShutdown {
    fn power_off(&self) {
        let Some((program, args)) = self.command.split_first() else {
            log::error!("[system] no shutdown command configured");
            return;
        };
        if self.dry_run {
            log::warn!("[system] dry run: would run {}", self.command.join(" "));
            return;
        }
        log::warn!("[system] powering off: {}", self.command.join(" "));
        match Command::new(program).args(args).status() {
            Ok(status) if status.success() => {}
            Ok(status) => log::error!("[system] {program} exited with {status}"),
            Err(e) => log::error!("[system] cannot run {program}: {e}"),
        }
    }
}

/// Passes through the first `power_off` and ignores the rest.
pub struct ShutdownOnce {
    inner: std::sync::Arc<dyn Shutdown>,
    fired: AtomicBool,
}

impl ShutdownOnce {
    pub fn new(inner: std::sync::Arc<dyn Shutdown>) -> Self {
        Self {
            inner,
            fired: AtomicBool::new(false),
        }
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Shutdown for ShutdownOnce {
    fn power_off(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            log::debug!("[system] shutdown already requested");
            return;
        }
        self.inner.power_off();
    }
}

// ---------------------------------------------------------------------------
// CountingShutdown  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Debug, Default)]
pub struct CountingShutdown(std::sync::atomic::AtomicU32);

#[cfg(test)]
impl CountingShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Shutdown for CountingShutdown {
    fn power_off(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn once_guard_passes_a_single_call() {
        let counter = Arc::new(CountingShutdown::new());
        let once = ShutdownOnce::new(counter.clone());
        assert!(!once.fired());
        once.power_off();
        once.power_off();
        assert!(once.fired());
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn dry_run_does_not_execute() {
        let cfg = SystemConfig {
            shutdown_command: vec!["/nonexistent/poweroff".into()],
            dry_run: true,
            ..SystemConfig::default()
        };
        CommandShutdown::new(&cfg).power_off();
    }

    #[test]
    fn empty_command_is_logged_not_run() {
        let cfg = SystemConfig {
            shutdown_command: Vec::new(),
            ..SystemConfig::default()
        };
        CommandShutdown::new(&cfg).power_off();
    }
}
