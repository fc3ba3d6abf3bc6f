//! `mpg123`-backed [`AudioOutput`].

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::{AudioOutput, Clip, Playback};
use crate::config::AudioConfig;

/// Added to the minimum dwell to get the hard playback timeout.
pub const PLAYBACK_MARGIN: Duration = Duration::from_secs(10);

const POLL: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("cannot start {player}: {source}")]
    Spawn {
        player: String,
        source: std::io::Error,
    },

    #[error("{clip} still playing after {after:?}; killed")]
    Timeout { clip: String, after: Duration },

    #[error("{clip} exited with {status}")]
    Exit { clip: String, status: ExitStatus },

    #[error("waiting on player failed: {0}")]
    Wait(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Mpg123Player
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Mpg123Player {
    player: String,
    clip_dir: PathBuf,
    clips: crate::config::ClipNames,
    pulse_server: Option<String>,
    margin: Duration,
    detached: Arc<Detached>,
}

impl Mpg123Player {
    pub fn new(cfg: &AudioConfig) -> Self {
        Self {
            player: cfg.player.clone(),
            clip_dir: cfg.clip_dir.clone(),
            clips: cfg.clips.clone(),
            pulse_server: cfg.pulse_server.clone(),
            margin: PLAYBACK_MARGIN,
            detached: Arc::default(),
        }
    }

    /// Override the timeout margin added to the minimum dwell.
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn clip_path(&self, clip: Clip) -> PathBuf {
        let file = match clip {
            Clip::Ready => &self.clips.ready,
            Clip::Step1 => &self.clips.step1,
            Clip::Step2 => &self.clips.step2,
            Clip::Complete => &self.clips.complete,
            Clip::Retry => &self.clips.retry,
            Clip::Shutdown => &self.clips.shutdown,
        };
        self.clip_dir.join(file)
    }

    fn spawn(&self, path: &Path) -> Result<Child, PlaybackError> {
        let mut cmd = Command::new(&self.player);
        cmd.arg("-q")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(server) = &self.pulse_server {
            cmd.env("PULSE_SERVER", server);
        }
        cmd.spawn().map_err(|source| PlaybackError::Spawn {
            player: self.player.clone(),
            source,
        })
    }

    /// Play `path` and wait at most `timeout`, killing the player when the
    /// deadline passes.
    pub fn play_to_end(&self, path: &Path, timeout: Duration) -> Result<(), PlaybackError> {
        let clip = display_name(path);
        let mut child = self.spawn(path)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return if status.success() {
                    Ok(())
                } else {
                    Err(PlaybackError::Exit { clip, status })
                };
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PlaybackError::Timeout {
                    clip,
                    after: timeout,
                });
            }
            std::thread::sleep(POLL);
        }
    }

    /// Start playback without waiting. The player stays tracked until it
    /// exits or [`stop_all`](AudioOutput::stop_all) kills it; a reaper
    /// thread collects its exit status.
    pub fn play_detached(&self, path: &Path) -> Result<(), PlaybackError> {
        let child = self.spawn(path)?;
        let pid = child.id();
        self.detached.track(display_name(path), child);

        let detached = Arc::clone(&self.detached);
        let reaper = std::thread::Builder::new()
            .name("audio-reaper".into())
            .spawn(move || {
                while detached.poll(pid) {
                    std::thread::sleep(POLL);
                }
            });
        if let Err(e) = reaper {
            log::warn!("[audio] cannot spawn reaper thread: {e}");
        }
        Ok(())
    }

    /// Number of detached players still tracked.
    pub fn detached_count(&self) -> usize {
        self.detached.len()
    }
}

// ---------------------------------------------------------------------------
// Detached players
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Detached(Mutex<Vec<(String, Child)>>);

impl Detached {
    fn track(&self, clip: String, child: Child) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((clip, child));
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Collect `pid` if it has exited. `true` while it is still running.
    fn poll(&self, pid: u32) -> bool {
        let mut players = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = players.iter().position(|(_, c)| c.id() == pid) else {
            // Already collected by stop_all.
            return false;
        };
        let (clip, child) = &mut players[index];
        let done = match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    log::warn!("[audio] {clip} exited with {status}");
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("[audio] waiting on {clip}: {e}");
                true
            }
        };
        if done {
            players.swap_remove(index);
        }
        !done
    }

    fn stop_all(&self) {
        let players = std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner));
        for (clip, mut child) in players {
            if matches!(child.try_wait(), Ok(Some(_))) {
                continue;
            }
            log::info!("[audio] stopping {clip}");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl AudioOutput for Mpg123Player {
    fn play(&self, clip: Clip, mode: Playback) {
        let path = self.clip_path(clip);
        log::info!("[audio] playing {}", display_name(&path));

        match mode {
            Playback::Background => {
                if let Err(e) = self.play_detached(&path) {
                    log::warn!("[audio] {e}");
                }
            }
            Playback::Blocking { min_dwell } => {
                let started = Instant::now();
                if let Err(e) = self.play_to_end(&path, min_dwell + self.margin) {
                    log::warn!("[audio] {e}");
                }
                let elapsed = started.elapsed();
                if let Some(rest) = min_dwell.checked_sub(elapsed) {
                    std::thread::sleep(rest);
                }
                log::info!(
                    "[audio] {} done (played {:.1}s)",
                    clip.label(),
                    elapsed.as_secs_f32()
                );
            }
        }
    }

    fn stop_all(&self) {
        self.detached.stop_all();
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
