//! Host processes around the tool: the USB multiplexer daemon and stray
//! instances left behind by a killed session.

use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::SystemConfig;

/// How long to wait for the usbmuxd socket after launch.
const SOCKET_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("usbmuxd command is empty")]
    EmptyCommand,

    #[error("cannot open usbmuxd log {path}: {source}")]
    Log {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Reaping
// ---------------------------------------------------------------------------

/// Parse `pgrep` output, skipping `own_pid`.
pub fn parse_pids(listing: &str, own_pid: u32) -> Vec<u32> {
    listing
        .lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .filter(|&pid| pid != own_pid)
        .collect()
}

/// `SIGKILL` every process whose command line contains `name`.
///
/// Best effort: failures are logged. Returns how many kills were issued.
pub fn kill_by_name(name: &str) -> usize {
    let listing = match Command::new("pgrep")
        .args(["-f", name])
        .stderr(Stdio::null())
        .output()
    {
        Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
        Err(e) => {
            log::warn!("[system] cannot run pgrep: {e}");
            return 0;
        }
    };

    let pids = parse_pids(&listing, std::process::id());
    for pid in &pids {
        let status = Command::new("sudo")
            .args(["kill", "-9", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            log::warn!("[system] cannot kill {name} ({pid}): {e}");
        }
    }
    if !pids.is_empty() {
        log::info!("[system] killed {} {name} process(es)", pids.len());
    }
    pids.len()
}

/// Reap every configured name.
pub fn reap(names: &[String]) {
    for name in names {
        kill_by_name(name);
    }
}

// ---------------------------------------------------------------------------
// usbmuxd
// ---------------------------------------------------------------------------

/// A usbmuxd instance launched in its own process group.
#[derive(Debug)]
pub struct Usbmuxd {
    child: Child,
}

impl Usbmuxd {
    /// Kill any running usbmuxd, start a fresh one and wait briefly for its
    /// socket.
    pub fn restart(cfg: &SystemConfig) -> Result<Self, ProcessError> {
        log::info!("[usb] restarting usbmuxd");
        kill_by_name("usbmuxd");
        let usbmuxd = Self::launch(cfg)?;
        if wait_for_path(&cfg.usbmuxd_socket, SOCKET_WAIT) {
            log::info!("[usb] usbmuxd ready");
        } else {
            log::warn!(
                "[usb] {} did not appear within {:?}; continuing",
                cfg.usbmuxd_socket.display(),
                SOCKET_WAIT
            );
        }
        Ok(usbmuxd)
    }

    fn launch(cfg: &SystemConfig) -> Result<Self, ProcessError> {
        let (program, args) = cfg
            .usbmuxd_command
            .split_first()
            .ok_or(ProcessError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).process_group(0);
        match &cfg.usbmuxd_log {
            Some(path) => {
                let log = File::create(path).map_err(|source| ProcessError::Log {
                    path: path.display().to_string(),
                    source,
                })?;
                let err = log.try_clone().map_err(|source| ProcessError::Log {
                    path: path.display().to_string(),
                    source,
                })?;
                cmd.stdout(log).stderr(err);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        Ok(Self { child })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Kill the launched process and reap it.
    pub fn stop(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Poll for `path` to exist, up to `timeout`.
pub fn wait_for_path(path: &Path, timeout: Duration) -> bool {
    let started = Instant::now();
    loop {
        if path.exists() {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_parsing_skips_self_and_garbage() {
        let listing = "123\n  456 \nabc\n\n789\n";
        assert_eq!(parse_pids(listing, 456), vec![123, 789]);
        assert!(parse_pids("", 1).is_empty());
    }

    #[test]
    fn waits_for_a_path_that_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");
        let target = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            std::fs::write(target, b"").unwrap();
        });
        assert!(wait_for_path(&path, Duration::from_secs(2)));
        writer.join().unwrap();
        assert!(!wait_for_path(&dir.path().join("missing"), Duration::from_millis(150)));
    }

    #[test]
    fn launch_writes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("usbmuxd.txt");
        let cfg = SystemConfig {
            usbmuxd_command: vec!["sh".into(), "-c".into(), "echo started".into()],
            usbmuxd_log: Some(log.clone()),
            ..SystemConfig::default()
        };
        let mut usbmuxd = Usbmuxd::launch(&cfg).unwrap();
        assert!(usbmuxd.pid() > 0);
        usbmuxd.child.wait().unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "started");
        usbmuxd.stop();
    }

    #[test]
    fn empty_command_is_rejected() {
        let cfg = SystemConfig {
            usbmuxd_command: Vec::new(),
            ..SystemConfig::default()
        };
        assert!(matches!(
            Usbmuxd::launch(&cfg),
            Err(ProcessError::EmptyCommand)
        ));
    }
}
