//! Application entry point.
//!
//! # Startup sequence
//!
//! 1. Resolve and load [`AppConfig`] (first argument, `AUTORAIN_CONFIG`, or
//!    `~/.config/autorain/settings.toml`).
//! 2. Initialise logging, mirrored to `logging.file` when set.
//! 3. Start the signal thread (current-thread tokio runtime) that raises the
//!    interrupt token on SIGINT or SIGTERM.
//! 4. Run [`boot::run`] on the main thread until a terminal outcome.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use autorain::{
    automation::RunOutcome,
    boot::{self, BootError, HostPlatform},
    cancel::CancelToken,
    config::{AppConfig, AppPaths},
    lease::LeaseError,
};
use tokio::signal::unix::{signal, SignalKind};

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Writes every log line to stdout and an append-only file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}

fn init_logging(file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }
    builder.init();
    Ok(())
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

fn spawn_signal_listener(interrupt: CancelToken) -> io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            rt.block_on(async {
                let mut terminate = match signal(SignalKind::terminate()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        log::error!("[system] cannot listen for SIGTERM: {e}");
                        return;
                    }
                };
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            log::error!("[system] cannot listen for SIGINT: {e}");
                            return;
                        }
                        log::warn!("[system] SIGINT received; stopping");
                    }
                    _ = terminate.recv() => log::warn!("[system] SIGTERM received; stopping"),
                }
                interrupt.cancel();
            });
        })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<ExitCode> {
    // 1. Configuration
    let settings = AppPaths::resolve_settings(std::env::args_os().nth(1).map(PathBuf::from));
    let config = AppConfig::load_from(&settings)
        .with_context(|| format!("cannot load {}", settings.display()))?;

    // 2. Logging
    init_logging(config.logging.file.as_deref())?;
    log::info!("autorain starting (config {})", settings.display());

    // 3. Signals
    let interrupt = CancelToken::new();
    spawn_signal_listener(interrupt.clone()).context("cannot start signal listener")?;

    // 4. Boot
    match boot::run(&config, Arc::new(HostPlatform::new()), interrupt) {
        Ok(summary) => {
            log::info!(
                "[system] finished: {:?} after {} attempt(s), {} retries (last phase: {})",
                summary.outcome,
                summary.attempts,
                summary.retries,
                summary.last_phase.label()
            );
            Ok(match summary.outcome {
                RunOutcome::Success => ExitCode::SUCCESS,
                RunOutcome::Exhausted => ExitCode::from(1),
                RunOutcome::Interrupted => ExitCode::from(130),
            })
        }
        Err(BootError::Lease(LeaseError::AlreadyRunning { pid })) => {
            log::error!("[system] autorain already running (pid {pid}); exiting");
            Ok(ExitCode::from(1))
        }
        Err(e) => Err(e.into()),
    }
}
