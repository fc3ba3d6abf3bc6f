//! Software PWM: one thread per LED channel toggling a binary line.
//!
//! ```text
//! ChannelTargets (Mutex)  ◀── set_target / set_rgb  (animations, feedback)
//!        │ polled once per period
//!        ▼
//! channel thread ×9 ──▶ HardwareLines::set(line, on/off)
//! ```
//!
//! Each thread reads its duty at the start of every period, drives the line
//! active for `duty/255` of the period and inactive for the rest. Channels
//! are not phase-locked to each other. A line is only written when its level
//! changes, so duty 0 and 255 hold a constant level without toggling.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use std::thread::JoinHandle;
use std::time::Duration;

use super::color::{Rgb, OFF};
use super::lines::{HardwareLines, LineId};

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// One colour channel of an RGB LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Red, Channel::Green, Channel::Blue];

    fn index(self) -> usize {
        match self {
            Channel::Red => 0,
            Channel::Green => 1,
            Channel::Blue => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Channel::Red => "r",
            Channel::Green => "g",
            Channel::Blue => "b",
        }
    }
}

/// Zero-based LED index; LED 0 is the one closest to the Ethernet jack.
pub type LedId = usize;

/// Line offsets of one LED as `[red, green, blue]`.
pub type LedPins = [LineId; 3];

// ---------------------------------------------------------------------------
// LedSurface
// ---------------------------------------------------------------------------

/// Anything an animation can paint on.
pub trait LedSurface: Send + Sync {
    fn led_count(&self) -> usize;

    fn set_rgb(&self, led: LedId, colour: Rgb);

    fn rgb(&self, led: LedId) -> Rgb;

    fn set_all(&self, colour: Rgb) {
        for led in 0..self.led_count() {
            self.set_rgb(led, colour);
        }
    }

    fn clear(&self) {
        self.set_all(OFF);
    }
}

// ---------------------------------------------------------------------------
// ChannelTargets
// ---------------------------------------------------------------------------

/// Duty targets for every (LED, channel) pair under one lock.
///
/// Writes to an LED index outside the rig are ignored.
#[derive(Debug)]
pub struct ChannelTargets {
    duties: Mutex<Vec<[u8; 3]>>,
}

impl ChannelTargets {
    pub fn new(led_count: usize) -> Self {
        Self {
            duties: Mutex::new(vec![[0; 3]; led_count]),
        }
    }

    pub fn get(&self, led: LedId, channel: Channel) -> u8 {
        let duties = self.duties.lock().unwrap_or_else(PoisonError::into_inner);
        duties.get(led).map_or(0, |d| d[channel.index()])
    }

    pub fn set(&self, led: LedId, channel: Channel, duty: u8) {
        let mut duties = self.duties.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(d) = duties.get_mut(led) {
            d[channel.index()] = duty;
        }
    }
}

impl LedSurface for ChannelTargets {
    fn led_count(&self) -> usize {
        self.duties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn set_rgb(&self, led: LedId, (r, g, b): Rgb) {
        let mut duties = self.duties.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(d) = duties.get_mut(led) {
            *d = [r, g, b];
        }
    }

    fn rgb(&self, led: LedId) -> Rgb {
        let duties = self.duties.lock().unwrap_or_else(PoisonError::into_inner);
        duties.get(led).map_or(OFF, |d| (d[0], d[1], d[2]))
    }

    fn set_all(&self, (r, g, b): Rgb) {
        let mut duties = self.duties.lock().unwrap_or_else(PoisonError::into_inner);
        for d in duties.iter_mut() {
            *d = [r, g, b];
        }
    }
}

// ---------------------------------------------------------------------------
// Duty arithmetic
// ---------------------------------------------------------------------------

/// Split one PWM period into `(active, inactive)` time for `duty`.
///
/// The active share is `period * duty / 255` truncated to the nanosecond,
/// so it is exactly zero at duty 0 and exactly the full period at 255.
pub fn pwm_split(duty: u8, period: Duration) -> (Duration, Duration) {
    let period_ns = period.as_nanos();
    let active_ns = period_ns * u128::from(duty) / 255;
    let active = Duration::from_nanos(active_ns as u64);
    (active, period.saturating_sub(active))
}

// ---------------------------------------------------------------------------
// PwmEngine
// ---------------------------------------------------------------------------

/// Owns the channel threads and the shared duty targets.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use autorain::led::{Channel, NullLines, PwmEngine};
///
/// let engine = PwmEngine::start(
///     Arc::new(NullLines),
///     vec![[232, 75, 71]],
///     Duration::from_millis(1),
/// );
/// engine.set_target(0, Channel::Green, 128);
/// engine.stop();
/// ```
pub struct PwmEngine {
    targets: Arc<ChannelTargets>,
    lines: Arc<dyn HardwareLines>,
    layout: Vec<LedPins>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PwmEngine {
    /// Spawn one thread per channel of every LED in `layout`.
    ///
    /// A channel whose thread cannot be spawned is logged and left dark; the
    /// rest of the rig keeps working.
    pub fn start(lines: Arc<dyn HardwareLines>, layout: Vec<LedPins>, period: Duration) -> Self {
        let targets = Arc::new(ChannelTargets::new(layout.len()));
        let running = Arc::new(AtomicBool::new(true));
        let mut workers = Vec::with_capacity(layout.len() * 3);

        for (led, pins) in layout.iter().enumerate() {
            for channel in Channel::ALL {
                let worker = ChannelWorker {
                    led,
                    channel,
                    line: pins[channel.index()],
                    period,
                    targets: Arc::clone(&targets),
                    lines: Arc::clone(&lines),
                    running: Arc::clone(&running),
                };
                let spawned = std::thread::Builder::new()
                    .name(format!("pwm-{}{}", led + 1, channel.label()))
                    .spawn(move || worker.run());
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(e) => log::error!(
                        "[led] cannot spawn PWM thread for led {} {}: {e}",
                        led + 1,
                        channel.label()
                    ),
                }
            }
        }

        log::info!("[led] PWM started ({} threads)", workers.len());
        Self {
            targets,
            lines,
            layout,
            running,
            workers: Mutex::new(workers),
        }
    }

    pub fn set_target(&self, led: LedId, channel: Channel, duty: u8) {
        self.targets.set(led, channel, duty);
    }

    pub fn target(&self, led: LedId) -> Rgb {
        self.targets.rgb(led)
    }

    /// Zero every target and drive every line inactive right away instead
    /// of waiting for the next period.
    pub fn all_off(&self) {
        self.targets.clear();
        let values: Vec<(LineId, bool)> = self
            .layout
            .iter()
            .flat_map(|pins| pins.iter().map(|&line| (line, false)))
            .collect();
        if let Err(e) = self.lines.set_many(&values) {
            log::warn!("[led] all-off write failed: {e}");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop every channel thread and leave all lines inactive. Idempotent.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.join();
        }
        self.all_off();
        if was_running {
            log::info!("[led] PWM stopped");
        }
    }
}

impl LedSurface for PwmEngine {
    fn led_count(&self) -> usize {
        self.layout.len()
    }

    fn set_rgb(&self, led: LedId, colour: Rgb) {
        self.targets.set_rgb(led, colour);
    }

    fn rgb(&self, led: LedId) -> Rgb {
        self.targets.rgb(led)
    }

    fn set_all(&self, colour: Rgb) {
        self.targets.set_all(colour);
    }
}

impl Drop for PwmEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// ChannelWorker
// ---------------------------------------------------------------------------

struct ChannelWorker {
    led: LedId,
    channel: Channel,
    line: LineId,
    period: Duration,
    targets: Arc<ChannelTargets>,
    lines: Arc<dyn HardwareLines>,
    running: Arc<AtomicBool>,
}

impl ChannelWorker {
    fn run(self) {
        // Level last written successfully; `None` forces the next write.
        let mut level: Option<bool> = None;
        let mut failing = false;

        while self.running.load(Ordering::Acquire) {
            let duty = self.targets.get(self.led, self.channel);
            let (active, inactive) = pwm_split(duty, self.period);

            if !active.is_zero() {
                self.drive(true, &mut level, &mut failing);
                std::thread::sleep(active);
            }
            if !inactive.is_zero() {
                self.drive(false, &mut level, &mut failing);
                std::thread::sleep(inactive);
            }
        }
    }

    fn drive(&self, active: bool, level: &mut Option<bool>, failing: &mut bool) {
        if *level == Some(active) {
            return;
        }
        match self.lines.set(self.line, active) {
            Ok(()) => {
                *level = Some(active);
                if *failing {
                    log::info!("[led] line {} writable again", self.line);
                    *failing = false;
                }
            }
            Err(e) => {
                *level = None;
                if !*failing {
                    log::warn!("[led] {e}; retrying every cycle");
                    *failing = true;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
