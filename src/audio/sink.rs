//! PulseAudio sink helpers driven through `pactl`.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

const SINK_POLL: Duration = Duration::from_millis(200);

/// Id of the first Bluetooth (`bluez`) sink in `pactl list short sinks`
/// output.
pub fn bluez_sink_id(listing: &str) -> Option<&str> {
    listing
        .lines()
        .find(|line| line.contains("bluez"))
        .and_then(|line| line.split_whitespace().next())
}

/// Every sink id in `pactl list short sinks` output.
pub fn sink_ids(listing: &str) -> Vec<&str> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .collect()
}

fn pactl(pulse_server: Option<&str>) -> Command {
    let mut cmd = Command::new("pactl");
    if let Some(server) = pulse_server {
        cmd.env("PULSE_SERVER", server);
    }
    cmd.stdin(Stdio::null()).stderr(Stdio::null());
    cmd
}

fn list_sinks(pulse_server: Option<&str>) -> Option<String> {
    let out = pactl(pulse_server)
        .args(["list", "short", "sinks"])
        .output()
        .ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Poll until a Bluetooth sink shows up, `timeout` passes or `cancel` fires.
pub fn wait_for_sink(pulse_server: Option<&str>, timeout: Duration, cancel: &CancelToken) -> bool {
    log::info!("[audio] waiting for Bluetooth sink");
    let started = Instant::now();
    while started.elapsed() < timeout {
        if let Some(listing) = list_sinks(pulse_server) {
            if bluez_sink_id(&listing).is_some() {
                log::info!("[audio] Bluetooth sink detected");
                return true;
            }
        }
        if !cancel.sleep(SINK_POLL) {
            return false;
        }
    }
    log::warn!("[audio] no Bluetooth sink after {timeout:?}; continuing");
    false
}

/// Set the Bluetooth sink to `percent`, or every sink when none is
/// Bluetooth.
pub fn set_volume(pulse_server: Option<&str>, percent: u8) {
    let Some(listing) = list_sinks(pulse_server) else {
        log::warn!("[audio] cannot list sinks; volume unchanged");
        return;
    };
    let volume = format!("{percent}%");

    let targets: Vec<&str> = match bluez_sink_id(&listing) {
        Some(id) => vec![id],
        None => sink_ids(&listing),
    };
    for id in &targets {
        let status = pactl(pulse_server)
            .args(["set-sink-volume", id, &volume])
            .stdout(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => log::info!("[audio] sink {id} volume {volume}"),
            Ok(s) => log::warn!("[audio] set-sink-volume {id} exited with {s}"),
            Err(e) => log::warn!("[audio] cannot run pactl: {e}"),
        }
    }
}
