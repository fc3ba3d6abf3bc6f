//! Spoken audio cues over a Bluetooth speaker.
//!
//! # Pipeline
//!
//! ```text
//! FeedbackEvent → Clip → AudioOutput::play(clip, Playback)
//!                          └── Mpg123Player: `mpg123 -q <clip_dir>/<file>`
//!                                            with PULSE_SERVER exported
//! ```
//!
//! Playback never fails the caller: every error is logged under `[audio]`
//! and the blocking mode still honours its minimum dwell so the operator
//! gets the same pacing with or without a speaker.
//!
//! [`sink`] holds the PulseAudio helpers used once the speaker connects.

pub mod player;
pub mod sink;

use std::time::Duration;

pub use player::{Mpg123Player, PlaybackError};

// ---------------------------------------------------------------------------
// Clip / Playback
// ---------------------------------------------------------------------------

/// The fixed set of spoken cues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Clip {
    /// "Ready": speaker connected, waiting for a device.
    Ready,
    /// Hold the button combination (DFU step 1).
    Step1,
    /// Release the power button (DFU step 2).
    Step2,
    Complete,
    Retry,
    Shutdown,
}

impl Clip {
    pub fn label(self) -> &'static str {
        match self {
            Clip::Ready => "ready",
            Clip::Step1 => "step1",
            Clip::Step2 => "step2",
            Clip::Complete => "complete",
            Clip::Retry => "retry",
            Clip::Shutdown => "shutdown",
        }
    }
}

/// How [`AudioOutput::play`] waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playback {
    /// Start playback and return immediately.
    Background,
    /// Return once playback ended (or timed out) and at least `min_dwell`
    /// has elapsed since the call.
    Blocking { min_dwell: Duration },
}

// ---------------------------------------------------------------------------
// AudioOutput trait
// ---------------------------------------------------------------------------

pub trait AudioOutput: Send + Sync {
    /// Play `clip`. Failures are logged, never returned.
    fn play(&self, clip: Clip, mode: Playback);

    /// Kill anything still playing in the background.
    fn stop_all(&self) {}
}

/// Plays nothing; blocking calls still sleep out their minimum dwell.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentAudio;

impl AudioOutput for SilentAudio {
    fn play(&self, clip: Clip, mode: Playback) {
        log::debug!("[audio] (silent) {}", clip.label());
        if let Playback::Blocking { min_dwell } = mode {
            std::thread::sleep(min_dwell);
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingAudio  (test-only)
// ---------------------------------------------------------------------------

/// Records every request without sleeping.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingAudio {
    played: std::sync::Mutex<Vec<(Clip, Playback)>>,
    stops: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl RecordingAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn played(&self) -> Vec<(Clip, Playback)> {
        self.played.lock().unwrap().clone()
    }

    pub fn clips(&self) -> Vec<Clip> {
        self.played().into_iter().map(|(c, _)| c).collect()
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl AudioOutput for RecordingAudio {
    fn play(&self, clip: Clip, mode: Playback) {
        self.played.lock().unwrap().push((clip, mode));
    }

    fn stop_all(&self) {
        self.stops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn silent_audio_still_dwells() {
        let started = Instant::now();
        SilentAudio.play(
            Clip::Step1,
            Playback::Blocking {
                min_dwell: Duration::from_millis(40),
            },
        );
        assert!(started.elapsed() >= Duration::from_millis(40));

        let started = Instant::now();
        SilentAudio.play(Clip::Retry, Playback::Background);
        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn recording_audio_keeps_order() {
        let audio = RecordingAudio::new();
        audio.play(Clip::Ready, Playback::Background);
        audio.play(Clip::Complete, Playback::Background);
        assert_eq!(audio.clips(), vec![Clip::Ready, Clip::Complete]);
    }
}
