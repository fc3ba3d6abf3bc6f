//! [`BluetoothControl`] over `bluetoothctl` and the speaker relay script.

use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::BluetoothControl;
use crate::config::BluetoothConfig;

/// Upper bound for any single `bluetoothctl` or relay invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct BluetoothCtl {
    power_script: String,
    use_sudo: bool,
    timeout: Duration,
}

impl BluetoothCtl {
    pub fn new(cfg: &BluetoothConfig) -> Self {
        Self {
            power_script: cfg.power_script.clone(),
            use_sudo: cfg.use_sudo,
            timeout: COMMAND_TIMEOUT,
        }
    }

    fn bluetoothctl(&self, args: &[&str]) -> Option<Output> {
        let mut cmd = Command::new("bluetoothctl");
        cmd.args(args);
        run_bounded(cmd, self.timeout)
    }

    fn relay(&self) -> Option<Output> {
        let cmd = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg(&self.power_script);
            c
        } else {
            Command::new(&self.power_script)
        };
        run_bounded(cmd, self.timeout)
    }
}

/// `true` when `bluetoothctl info` output reports an active link.
pub fn info_says_connected(info: &str) -> bool {
    info.lines().any(|l| l.trim() == "Connected: yes")
}

impl BluetoothControl for BluetoothCtl {
    fn is_connected(&self, device: &str) -> bool {
        self.bluetoothctl(&["info", device])
            .filter(|out| out.status.success())
            .is_some_and(|out| info_says_connected(&String::from_utf8_lossy(&out.stdout)))
    }

    fn connect(&self, device: &str) -> bool {
        let reported = self
            .bluetoothctl(&["connect", device])
            .is_some_and(|out| out.status.success());
        reported && self.is_connected(device)
    }

    fn disconnect(&self, device: &str) {
        let _ = self.bluetoothctl(&["disconnect", device]);
    }

    fn power_cycle(&self) -> bool {
        log::info!("[bt] power cycling speaker");
        match self.relay() {
            Some(out) if out.status.success() => true,
            Some(out) => {
                log::error!(
                    "[bt] power script failed ({}): {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                false
            }
            None => false,
        }
    }

    fn power_off(&self) {
        log::info!("[bt] powering speaker off");
        let _ = self.relay();
    }
}

/// Run `cmd` to completion, killing it after `timeout`.
///
/// Both pipes are drained on their own threads while the command runs, so a
/// chatty command cannot stall on a full pipe. Returns `None` when the
/// command cannot start or times out; both are logged.
fn run_bounded(mut cmd: Command, timeout: Duration) -> Option<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let program = format!("{:?}", cmd.get_program());
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            log::warn!("[bt] cannot run {program}: {e}");
            return None;
        }
    };
    let stdout = child.stdout.take().and_then(|pipe| drain(pipe, "bt-stdout"));
    let stderr = child.stderr.take().and_then(|pipe| drain(pipe, "bt-stderr"));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                log::warn!("[bt] {program} timed out after {timeout:?}");
                return None;
            }
            Ok(None) => std::thread::sleep(POLL),
            Err(e) => {
                log::warn!("[bt] waiting on {program}: {e}");
                return None;
            }
        }
    };

    Some(Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R, name: &str) -> Option<JoinHandle<Vec<u8>>> {
    let spawned = std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::warn!("[bt] cannot spawn {name} reader: {e}");
            None
        }
    }
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
