//! Animation routines and the pure frame functions behind them.
//!
//! An [`Effect`] is plain data. [`Effect::run`] executes it on the calling
//! thread against an [`EffectContext`], checking the cancel token at every
//! tick so a replacement animation never waits longer than one tick.

use std::time::{Duration, Instant};

use super::animation::ChaseSpeed;
use super::color::{self, Rgb, BLUE, DIM_GREEN, GREEN, OFF, RED};
use super::pwm::LedSurface;
use crate::cancel::CancelToken;

/// Interval between frames of the continuous effects.
pub const TICK: Duration = Duration::from_millis(20);

/// Hue distance between neighbouring LEDs in a chase, in turns.
pub const CHASE_OFFSET: f32 = 0.15;

/// Lowest brightness a pulse dips to.
pub const PULSE_FLOOR: f32 = 0.1;

// ---------------------------------------------------------------------------
// Frame functions
// ---------------------------------------------------------------------------

/// Hue advance per tick for a chase or fade at `speed` (clamped to 1..=100).
pub fn chase_step(speed: u8) -> f32 {
    let speed = speed.clamp(1, 100);
    0.001 + (f32::from(speed) / 100.0) * 0.019
}

/// Colour of LED `index` when the chase is at `hue`.
pub fn chase_frame(hue: f32, index: usize) -> Rgb {
    color::hue_to_rgb(hue + CHASE_OFFSET * index as f32)
}

/// Phase advance per tick of a pulse at `speed`.
pub fn pulse_step(speed: u8) -> f32 {
    0.05 + f32::from(speed) / 500.0
}

/// Brightness of a pulse at `phase`, always within `[PULSE_FLOOR, 1]`.
pub fn pulse_brightness(phase: f32) -> f32 {
    PULSE_FLOOR + (1.0 - PULSE_FLOOR) * 0.5 * (1.0 + phase.sin())
}

/// Frame `step` of a `steps`-long linear fade.
pub fn fade_frame(from: Rgb, to: Rgb, step: u32, steps: u32) -> Rgb {
    if steps == 0 {
        return to;
    }
    color::lerp(from, to, step as f32 / steps as f32)
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Set every LED to one colour and return.
    Solid(Rgb),
    /// Hold one colour for a fixed time.
    Hold { colour: Rgb, duration: Duration },
    /// `times` × (on for `on`, off for `on / 2`).
    Flash { colour: Rgb, times: u32, on: Duration },
    /// Linear fade from LED 0's current target to `colour`.
    Fade { colour: Rgb, steps: u32, delay: Duration },
    /// Offset rainbow across the LEDs. `speed: None` follows the live
    /// chase speed.
    RainbowChase {
        speed: Option<u8>,
        duration: Option<Duration>,
    },
    /// Every LED on the same cycling hue.
    RainbowFade {
        speed: u8,
        duration: Option<Duration>,
    },
    /// Breathing brightness of a single colour.
    Pulse {
        colour: Rgb,
        speed: u8,
        duration: Option<Duration>,
    },
    /// Flash through `colours` in order, `rounds` times.
    Palette {
        colours: Vec<Rgb>,
        rounds: u32,
        on: Duration,
        off: Duration,
    },
    /// Run children in order; stops at the first cancelled child.
    Sequence(Vec<Effect>),
}

/// How a routine ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectOutcome {
    Finished,
    Cancelled,
}

/// What an effect paints on and listens to.
pub struct EffectContext<'a> {
    pub surface: &'a dyn LedSurface,
    pub speed: &'a ChaseSpeed,
    pub cancel: &'a CancelToken,
}

impl EffectContext<'_> {
    fn pause(&self, duration: Duration) -> Result<(), EffectOutcome> {
        if self.cancel.sleep(duration) {
            Ok(())
        } else {
            Err(EffectOutcome::Cancelled)
        }
    }

    fn check(&self) -> Result<(), EffectOutcome> {
        if self.cancel.is_cancelled() {
            Err(EffectOutcome::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn expired(started: Instant, duration: Option<Duration>) -> bool {
    duration.is_some_and(|d| started.elapsed() >= d)
}

impl Effect {
    /// Red, blue, then green double flashes with short gaps.
    pub fn color_test() -> Self {
        let flash = |colour| Effect::Flash {
            colour,
            times: 2,
            on: Duration::from_millis(400),
        };
        let gap = Effect::Hold {
            colour: OFF,
            duration: Duration::from_millis(200),
        };
        Effect::Sequence(vec![flash(RED), gap.clone(), flash(BLUE), gap, flash(GREEN)])
    }

    /// Five seconds of fast rainbow, a palette flash, green flashes and a
    /// steady dim green.
    pub fn celebration() -> Self {
        Effect::Sequence(vec![
            Effect::RainbowFade {
                speed: 100,
                duration: Some(Duration::from_secs(5)),
            },
            Effect::Palette {
                colours: vec![
                    (255, 0, 0),
                    (255, 128, 0),
                    (255, 255, 0),
                    (0, 255, 0),
                    (0, 255, 255),
                    (0, 0, 255),
                    (128, 0, 255),
                    (255, 0, 255),
                    (255, 255, 255),
                ],
                rounds: 3,
                on: Duration::from_millis(120),
                off: Duration::from_millis(50),
            },
            Effect::Flash {
                colour: GREEN,
                times: 5,
                on: Duration::from_millis(300),
            },
            Effect::Solid(DIM_GREEN),
        ])
    }

    pub fn name(&self) -> &'static str {
        match self {
            Effect::Solid(_) => "solid",
            Effect::Hold { .. } => "hold",
            Effect::Flash { .. } => "flash",
            Effect::Fade { .. } => "fade",
            Effect::RainbowChase { .. } => "rainbow-chase",
            Effect::RainbowFade { .. } => "rainbow-fade",
            Effect::Pulse { .. } => "pulse",
            Effect::Palette { .. } => "palette",
            Effect::Sequence(_) => "sequence",
        }
    }

    /// Run to completion or until `ctx.cancel` is raised.
    pub fn run(&self, ctx: &EffectContext<'_>) -> EffectOutcome {
        match self.run_inner(ctx) {
            Ok(()) => EffectOutcome::Finished,
            Err(outcome) => outcome,
        }
    }

    fn run_inner(&self, ctx: &EffectContext<'_>) -> Result<(), EffectOutcome> {
        ctx.check()?;
        let surface = ctx.surface;
        match self {
            Effect::Solid(colour) => surface.set_all(*colour),

            Effect::Hold { colour, duration } => {
                surface.set_all(*colour);
                ctx.pause(*duration)?;
            }

            Effect::Flash { colour, times, on } => {
                for _ in 0..*times {
                    surface.set_all(*colour);
                    ctx.pause(*on)?;
                    surface.clear();
                    ctx.pause(*on / 2)?;
                }
            }

            Effect::Fade {
                colour,
                steps,
                delay,
            } => {
                let from = surface.rgb(0);
                for step in 0..=*steps {
                    ctx.check()?;
                    surface.set_all(fade_frame(from, *colour, step, *steps));
                    ctx.pause(*delay)?;
                }
            }

            Effect::RainbowChase { speed, duration } => {
                let started = Instant::now();
                let mut hue = 0.0_f32;
                loop {
                    ctx.check()?;
                    for led in 0..surface.led_count() {
                        surface.set_rgb(led, chase_frame(hue, led));
                    }
                    let current = speed.unwrap_or_else(|| ctx.speed.get());
                    hue = (hue + chase_step(current)).rem_euclid(1.0);
                    ctx.pause(TICK)?;
                    if expired(started, *duration) {
                        break;
                    }
                }
            }

            Effect::RainbowFade { speed, duration } => {
                let started = Instant::now();
                let step = chase_step(*speed);
                let mut hue = 0.0_f32;
                loop {
                    ctx.check()?;
                    surface.set_all(color::hue_to_rgb(hue));
                    hue = (hue + step).rem_euclid(1.0);
                    ctx.pause(TICK)?;
                    if expired(started, *duration) {
                        break;
                    }
                }
            }

            Effect::Pulse {
                colour,
                speed,
                duration,
            } => {
                let started = Instant::now();
                let step = pulse_step(*speed);
                let mut phase = 0.0_f32;
                loop {
                    ctx.check()?;
                    surface.set_all(color::scale(*colour, pulse_brightness(phase)));
                    phase = (phase + step) % std::f32::consts::TAU;
                    ctx.pause(TICK)?;
                    if expired(started, *duration) {
                        break;
                    }
                }
            }

            Effect::Palette {
                colours,
                rounds,
                on,
                off,
            } => {
                for _ in 0..*rounds {
                    for colour in colours {
                        surface.set_all(*colour);
                        ctx.pause(*on)?;
                        surface.clear();
                        ctx.pause(*off)?;
                    }
                }
            }

            Effect::Sequence(children) => {
                for child in children {
                    child.run_inner(ctx)?;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
