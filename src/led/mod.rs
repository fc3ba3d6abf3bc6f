//! RGB status LEDs: software PWM over GPIO lines plus an animation slot.
//!
//! ```text
//! LedRig
//!  ├── Arc<dyn HardwareLines>   GpioLines | NullLines
//!  ├── Arc<PwmEngine>           9 channel threads, duty targets
//!  └── AnimationScheduler       ≤ 1 effect thread, live ChaseSpeed
//! ```

pub mod animation;
pub mod color;
pub mod effects;
pub mod lines;
pub mod pwm;

use std::sync::Arc;

pub use animation::{AnimationScheduler, ChaseSpeed};
pub use color::Rgb;
pub use effects::{Effect, EffectOutcome};
pub use lines::{GpioLines, HardwareLines, LineError, LineId, NullLines};
pub use pwm::{Channel, ChannelTargets, LedSurface, PwmEngine};

use crate::config::LedConfig;

/// GPIO consumer label shown by `gpioinfo`.
const CONSUMER: &str = "autorain";

/// The running LED stack.
pub struct LedRig {
    engine: Arc<PwmEngine>,
    scheduler: AnimationScheduler,
    hardware: bool,
}

impl LedRig {
    /// Open the configured GPIO lines and start PWM.
    ///
    /// When the chip cannot be opened the error is returned if `cfg.required`
    /// is set; otherwise it is logged once and the rig runs on [`NullLines`].
    pub fn open(cfg: &LedConfig) -> Result<Self, LineError> {
        let all_lines: Vec<LineId> = cfg.pins.iter().flatten().copied().collect();

        let (lines, hardware): (Arc<dyn HardwareLines>, bool) = if !cfg.enabled {
            log::info!("[led] disabled in config");
            (Arc::new(NullLines), false)
        } else {
            match GpioLines::open(&cfg.gpio_chip, &all_lines, CONSUMER) {
                Ok(gpio) => (Arc::new(gpio), true),
                Err(e) if cfg.required => return Err(e),
                Err(e) => {
                    log::warn!("[led] {e}; continuing without LEDs");
                    (Arc::new(NullLines), false)
                }
            }
        };

        Ok(Self::with_lines(lines, cfg.pins.clone(), cfg, hardware))
    }

    /// Build a rig over caller-supplied lines.
    pub fn with_lines(
        lines: Arc<dyn HardwareLines>,
        layout: Vec<pwm::LedPins>,
        cfg: &LedConfig,
        hardware: bool,
    ) -> Self {
        let engine = Arc::new(PwmEngine::start(lines, layout, cfg.pwm_period()));
        let surface: Arc<dyn LedSurface> = Arc::clone(&engine) as Arc<dyn LedSurface>;
        Self {
            engine,
            scheduler: AnimationScheduler::new(surface),
            hardware,
        }
    }

    /// `true` when a real GPIO chip backs the rig.
    pub fn has_hardware(&self) -> bool {
        self.hardware
    }

    pub fn engine(&self) -> &Arc<PwmEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &AnimationScheduler {
        &self.scheduler
    }

    /// Stop the animation, blank the LEDs and stop PWM. Idempotent.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.engine.stop();
    }
}

impl Drop for LedRig {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_chip_degrades_unless_required() {
        let mut cfg = LedConfig {
            gpio_chip: "/dev/no-such-gpiochip".into(),
            ..LedConfig::default()
        };

        let rig = LedRig::open(&cfg).unwrap();
        assert!(!rig.has_hardware());
        assert_eq!(rig.engine().led_count(), cfg.pins.len());
        rig.shutdown();

        cfg.required = true;
        assert!(matches!(LedRig::open(&cfg), Err(LineError::Open { .. })));
    }

    #[test]
    fn disabled_rig_never_touches_the_chip() {
        let cfg = LedConfig {
            enabled: false,
            required: true,
            gpio_chip: "/dev/no-such-gpiochip".into(),
            ..LedConfig::default()
        };
        let rig = LedRig::open(&cfg).unwrap();
        assert!(!rig.has_hardware());
    }
}
