//! Operator feedback: named events mapped to audio cues and LED effects.
//!
//! Every state transition of the automation emits one [`FeedbackEvent`].
//! Which outputs exist is decided once at startup by choosing the
//! [`Feedback`] implementation; emitters never check for hardware.
//!
//! | Event | Audio | LEDs |
//! |-------|-------|------|
//! | `BootStarting` | | colour test, chase 70 |
//! | `SpeakerWaiting` | | blue pulse |
//! | `SpeakerConnected` | ready (2 s) | green flash ×3, live chase 65 |
//! | `SpeakerUnavailable` | | red flash, live chase 65 |
//! | `Ready` | | live chase 65 |
//! | `DeviceWaiting` | ready (dwell) | cyan pulse |
//! | `DeviceDetected` | | live chase 85 |
//! | `DfuHold` | step1 (hold) | yellow pulse |
//! | `DfuRelease` | step2 (release) | amber pulse |
//! | `Booting` | | live chase 100 |
//! | `Retry` | retry | red flash ×2, cyan pulse |
//! | `Fault` | | red flash ×2, cyan pulse |
//! | `Complete` | complete | celebration |
//! | `Failed` | shutdown | red flash ×5, red pulse |

use std::sync::Arc;
use std::time::Duration;

use crate::audio::{AudioOutput, Clip, Playback};
use crate::cancel::CancelToken;
use crate::config::ToolConfig;
use crate::led::color::{AMBER, BT_BLUE, CYAN, GREEN, RED, YELLOW};
use crate::led::{Effect, LedRig};

/// Minimum dwell of the "ready" cue after the speaker connects.
const SPEAKER_READY_DWELL: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// FeedbackEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackEvent {
    BootStarting,
    SpeakerWaiting,
    SpeakerConnected,
    SpeakerUnavailable,
    Ready,
    DeviceWaiting,
    DeviceDetected,
    DfuHold,
    DfuRelease,
    Booting,
    /// Download-mode timeout; the tool will be respawned.
    Retry,
    /// Unexpected tool exit, supervision timeout or spawn failure.
    Fault,
    Complete,
    Failed,
}

/// Sink for feedback events. `emit` may block for the cue's dwell time.
pub trait Feedback: Send + Sync {
    fn emit(&self, event: FeedbackEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFeedback;

impl Feedback for NoopFeedback {
    fn emit(&self, event: FeedbackEvent) {
        log::debug!("feedback {event:?} (no outputs)");
    }
}

// ---------------------------------------------------------------------------
// StatusFeedback
// ---------------------------------------------------------------------------

/// Dwell times of the blocking cues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CueTimings {
    pub waiting: Duration,
    pub dfu_hold: Duration,
    pub dfu_release: Duration,
}

impl CueTimings {
    pub fn from_config(tool: &ToolConfig) -> Self {
        let secs = |s: f32| Duration::from_secs_f32(s.max(0.0));
        Self {
            waiting: secs(tool.waiting_dwell_secs),
            dfu_hold: secs(tool.dfu_hold_secs),
            dfu_release: secs(tool.dfu_release_secs),
        }
    }
}

/// Drives the speaker and the LED rig.
pub struct StatusFeedback {
    audio: Arc<dyn AudioOutput>,
    leds: Option<Arc<LedRig>>,
    timings: CueTimings,
    cancel: CancelToken,
}

impl StatusFeedback {
    /// `cancel` cuts short the blocking LED sequences on interrupt.
    pub fn new(
        audio: Arc<dyn AudioOutput>,
        leds: Option<Arc<LedRig>>,
        timings: CueTimings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            audio,
            leds,
            timings,
            cancel,
        }
    }

    fn start(&self, effect: Effect) {
        if let Some(rig) = &self.leds {
            rig.scheduler().start(effect);
        }
    }

    fn run(&self, effect: Effect) {
        if let Some(rig) = &self.leds {
            rig.scheduler().run_blocking(&effect, &self.cancel);
        }
    }

    fn live_chase(&self, speed: u8) {
        if let Some(rig) = &self.leds {
            rig.scheduler().chase_speed().set(speed);
        }
        self.start(Effect::RainbowChase {
            speed: None,
            duration: None,
        });
    }

    fn pulse(&self, colour: crate::led::Rgb, speed: u8) {
        self.start(Effect::Pulse {
            colour,
            speed,
            duration: None,
        });
    }

    fn red_flash(&self, times: u32) {
        self.run(Effect::Flash {
            colour: RED,
            times,
            on: Duration::from_millis(200),
        });
    }

    fn blocking(&self, clip: Clip, min_dwell: Duration) {
        self.audio.play(clip, Playback::Blocking { min_dwell });
    }
}

impl Feedback for StatusFeedback {
    fn emit(&self, event: FeedbackEvent) {
        log::debug!("feedback {event:?}");
        match event {
            FeedbackEvent::BootStarting => {
                self.run(Effect::color_test());
                self.start(Effect::RainbowChase {
                    speed: Some(70),
                    duration: None,
                });
            }
            FeedbackEvent::SpeakerWaiting => self.pulse(BT_BLUE, 40),
            FeedbackEvent::SpeakerConnected => {
                self.run(Effect::Flash {
                    colour: GREEN,
                    times: 3,
                    on: Duration::from_millis(300),
                });
                self.live_chase(65);
                self.blocking(Clip::Ready, SPEAKER_READY_DWELL);
            }
            FeedbackEvent::SpeakerUnavailable => {
                self.red_flash(1);
                self.live_chase(65);
            }
            FeedbackEvent::Ready => self.live_chase(65),
            FeedbackEvent::DeviceWaiting => {
                self.pulse(CYAN, 30);
                self.blocking(Clip::Ready, self.timings.waiting);
            }
            FeedbackEvent::DeviceDetected => self.live_chase(85),
            FeedbackEvent::DfuHold => {
                self.pulse(YELLOW, 60);
                self.blocking(Clip::Step1, self.timings.dfu_hold);
            }
            FeedbackEvent::DfuRelease => {
                self.pulse(AMBER, 80);
                self.blocking(Clip::Step2, self.timings.dfu_release);
            }
            FeedbackEvent::Booting => self.live_chase(100),
            FeedbackEvent::Retry => {
                self.audio.play(Clip::Retry, Playback::Background);
                self.red_flash(2);
                self.pulse(CYAN, 30);
            }
            FeedbackEvent::Fault => {
                self.red_flash(2);
                self.pulse(CYAN, 30);
            }
            FeedbackEvent::Complete => {
                self.audio.play(Clip::Complete, Playback::Background);
                self.run(Effect::celebration());
            }
            FeedbackEvent::Failed => {
                self.red_flash(5);
                self.pulse(RED, 40);
                self.blocking(Clip::Shutdown, Duration::ZERO);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingFeedback  (test-only)
// ---------------------------------------------------------------------------

/// Records every emitted event in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingFeedback {
    events: std::sync::Mutex<Vec<FeedbackEvent>>,
}

#[cfg(test)]
impl RecordingFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FeedbackEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: FeedbackEvent) -> usize {
        self.events().iter().filter(|e| **e == event).count()
    }
}

#[cfg(test)]
impl Feedback for RecordingFeedback {
    fn emit(&self, event: FeedbackEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RecordingAudio;
    use crate::config::LedConfig;
    use crate::led::{LedSurface, NullLines};

    fn timings() -> CueTimings {
        CueTimings {
            waiting: Duration::from_millis(25),
            dfu_hold: Duration::from_millis(50),
            dfu_release: Duration::from_millis(100),
        }
    }

    fn rig() -> Arc<LedRig> {
        let cfg = LedConfig::default();
        Arc::new(LedRig::with_lines(
            Arc::new(NullLines),
            cfg.pins.clone(),
            &cfg,
            false,
        ))
    }

    #[test]
    fn timings_follow_tool_config() {
        let t = CueTimings::from_config(&ToolConfig::default());
        assert_eq!(t.dfu_hold, Duration::from_secs(5));
        assert_eq!(t.dfu_release, Duration::from_secs(10));
        assert_eq!(t.waiting, Duration::from_millis(2500));
    }

    #[test]
    fn dfu_cues_block_for_their_dwell() {
        let audio = Arc::new(RecordingAudio::new());
        let fb = StatusFeedback::new(audio.clone(), None, timings(), CancelToken::new());

        fb.emit(FeedbackEvent::DfuHold);
        fb.emit(FeedbackEvent::DfuRelease);

        assert_eq!(
            audio.played(),
            vec![
                (
                    Clip::Step1,
                    Playback::Blocking {
                        min_dwell: Duration::from_millis(50)
                    }
                ),
                (
                    Clip::Step2,
                    Playback::Blocking {
                        min_dwell: Duration::from_millis(100)
                    }
                ),
            ]
        );
    }

    #[test]
    fn silent_events_play_nothing() {
        let audio = Arc::new(RecordingAudio::new());
        let fb = StatusFeedback::new(audio.clone(), None, timings(), CancelToken::new());
        fb.emit(FeedbackEvent::DeviceDetected);
        fb.emit(FeedbackEvent::Booting);
        fb.emit(FeedbackEvent::Fault);
        assert!(audio.played().is_empty());
    }

    #[test]
    fn progress_events_raise_chase_speed() {
        let leds = rig();
        let fb = StatusFeedback::new(
            Arc::new(RecordingAudio::new()),
            Some(leds.clone()),
            timings(),
            CancelToken::new(),
        );

        fb.emit(FeedbackEvent::DeviceDetected);
        assert_eq!(leds.scheduler().chase_speed().get(), 85);
        assert!(leds.scheduler().is_running());

        fb.emit(FeedbackEvent::Booting);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(leds.scheduler().chase_speed().get(), 100);
        assert_eq!(leds.scheduler().live_count(), 1);
        leds.shutdown();
    }

    #[test]
    fn fault_flashes_then_pulses() {
        let leds = rig();
        let fb = StatusFeedback::new(
            Arc::new(RecordingAudio::new()),
            Some(leds.clone()),
            timings(),
            CancelToken::new(),
        );

        fb.emit(FeedbackEvent::Fault);
        std::thread::sleep(Duration::from_millis(40));
        let (r, g, b) = leds.engine().rgb(0);
        assert_eq!(r, 0);
        assert!(g > 0 && g == b, "expected cyan pulse, got {:?}", (r, g, b));
        leds.shutdown();
    }

    #[test]
    fn cancelled_feedback_skips_long_sequences() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let audio = Arc::new(RecordingAudio::new());
        let fb = StatusFeedback::new(audio.clone(), Some(rig()), timings(), cancel);

        let started = std::time::Instant::now();
        fb.emit(FeedbackEvent::Complete);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(audio.clips(), vec![Clip::Complete]);
    }

    #[test]
    fn recording_feedback_counts() {
        let fb = RecordingFeedback::new();
        fb.emit(FeedbackEvent::DeviceWaiting);
        fb.emit(FeedbackEvent::DeviceWaiting);
        fb.emit(FeedbackEvent::Booting);
        assert_eq!(fb.count(FeedbackEvent::DeviceWaiting), 2);
        assert_eq!(fb.events().len(), 3);
    }
}
