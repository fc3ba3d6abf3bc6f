//! Single-slot animation scheduler.
//!
//! At most one effect routine runs at a time. [`AnimationScheduler::start`]
//! cancels the running routine, joins it with a bounded timeout and only
//! then spawns the replacement, so the PWM targets never have two writers.
//! Blocking runs go through the same slot and only wait on the caller's
//! side.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::effects::{Effect, EffectContext, EffectOutcome};
use super::pwm::LedSurface;
use crate::cancel::{CancelToken, POLL_GRANULARITY};

/// Default wait for a cancelled routine before the scheduler moves on.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ChaseSpeed
// ---------------------------------------------------------------------------

/// Live chase speed in `1..=100`, read every tick by a running chase.
#[derive(Debug, Clone)]
pub struct ChaseSpeed(Arc<Mutex<u8>>);

impl ChaseSpeed {
    pub const DEFAULT: u8 = 50;

    pub fn new(speed: u8) -> Self {
        Self(Arc::new(Mutex::new(speed.clamp(1, 100))))
    }

    pub fn get(&self) -> u8 {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, speed: u8) {
        let clamped = speed.clamp(1, 100);
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = clamped;
        log::debug!("[led] chase speed {clamped}");
    }
}

impl Default for ChaseSpeed {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

// ---------------------------------------------------------------------------
// AnimationHandle
// ---------------------------------------------------------------------------

struct AnimationHandle {
    name: &'static str,
    cancel: CancelToken,
    thread: JoinHandle<()>,
}

impl AnimationHandle {
    /// Poll until the thread finishes or `timeout` elapses. `true` when it
    /// finished.
    fn join_within(self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.thread.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "[led] animation '{}' still running after {:?}; detaching",
                    self.name,
                    timeout
                );
                return false;
            }
            std::thread::sleep(POLL_GRANULARITY / 4);
        }
        let _ = self.thread.join();
        true
    }
}

// ---------------------------------------------------------------------------
// AnimationScheduler
// ---------------------------------------------------------------------------

pub struct AnimationScheduler {
    surface: Arc<dyn LedSurface>,
    speed: ChaseSpeed,
    slot: Mutex<Option<AnimationHandle>>,
    join_timeout: Duration,
    live: Arc<AtomicUsize>,
}

impl AnimationScheduler {
    pub fn new(surface: Arc<dyn LedSurface>) -> Self {
        Self::with_join_timeout(surface, DEFAULT_JOIN_TIMEOUT)
    }

    pub fn with_join_timeout(surface: Arc<dyn LedSurface>, join_timeout: Duration) -> Self {
        Self {
            surface,
            speed: ChaseSpeed::default(),
            slot: Mutex::new(None),
            join_timeout,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn chase_speed(&self) -> &ChaseSpeed {
        &self.speed
    }

    pub fn surface(&self) -> &Arc<dyn LedSurface> {
        &self.surface
    }

    /// Replace whatever is running with `effect`.
    pub fn start(&self, effect: Effect) {
        self.launch(effect);
    }

    /// Run `effect` in the slot and wait for it to end.
    ///
    /// Used for one-shot sequences (error flash, celebration) that must
    /// complete before the caller continues. The routine stays replaceable:
    /// a `start` or `run_blocking` from another thread cancels it, and so
    /// does `cancel`. Either way the result is [`EffectOutcome::Cancelled`].
    pub fn run_blocking(&self, effect: &Effect, cancel: &CancelToken) -> EffectOutcome {
        let Some(run) = self.launch(effect.clone()) else {
            return EffectOutcome::Cancelled;
        };
        loop {
            if let Some(outcome) = run.outcome() {
                return outcome;
            }
            if cancel.is_cancelled() {
                run.cancel.cancel();
            }
            if run.cancel.is_cancelled() {
                // Cancelled by the caller or replaced; the routine exits at
                // its next tick.
                let deadline = Instant::now() + self.join_timeout;
                while run.outcome().is_none() && Instant::now() < deadline {
                    std::thread::sleep(POLL_GRANULARITY / 4);
                }
                return EffectOutcome::Cancelled;
            }
            std::thread::sleep(POLL_GRANULARITY / 4);
        }
    }

    /// Cancel and join the current routine, then spawn `effect` into the
    /// slot. The slot lock is held throughout, so launches never overlap.
    fn launch(&self, effect: Effect) -> Option<RunTicket> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.take() {
            previous.cancel.cancel();
            previous.join_within(self.join_timeout);
        }

        let cancel = CancelToken::new();
        let result = Arc::new(Mutex::new(None));
        let name = effect.name();
        let ctx_surface = Arc::clone(&self.surface);
        let ctx_speed = self.speed.clone();
        let ctx_cancel = cancel.clone();
        let ctx_result = Arc::clone(&result);
        let live = Arc::clone(&self.live);

        let spawned = std::thread::Builder::new()
            .name(format!("led-{name}"))
            .spawn(move || {
                let outcome = {
                    let _guard = LiveGuard::enter(live);
                    effect.run(&EffectContext {
                        surface: ctx_surface.as_ref(),
                        speed: &ctx_speed,
                        cancel: &ctx_cancel,
                    })
                };
                if outcome == EffectOutcome::Cancelled {
                    log::debug!("[led] animation '{name}' cancelled");
                }
                *ctx_result.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
            });

        match spawned {
            Ok(thread) => {
                log::debug!("[led] animation '{name}' started");
                *slot = Some(AnimationHandle {
                    name,
                    cancel: cancel.clone(),
                    thread,
                });
                Some(RunTicket { cancel, result })
            }
            Err(e) => {
                log::error!("[led] cannot spawn animation '{name}': {e}");
                None
            }
        }
    }

    /// Raise the running routine's cancel token. Does not wait.
    pub fn stop(&self) {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            handle.cancel.cancel();
        }
    }

    /// Wait up to `timeout` for the current routine to end. `true` when
    /// nothing is running afterwards.
    pub fn wait(&self, timeout: Duration) -> bool {
        let handle = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            None => true,
            Some(handle) if handle.thread.is_finished() => {
                let _ = handle.thread.join();
                true
            }
            Some(handle) => {
                let deadline = Instant::now() + timeout;
                while !handle.thread.is_finished() && Instant::now() < deadline {
                    std::thread::sleep(POLL_GRANULARITY / 4);
                }
                if handle.thread.is_finished() {
                    let _ = handle.thread.join();
                    true
                } else {
                    // Put it back so a later stop() still reaches it.
                    *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                    false
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.thread.is_finished())
    }

    /// Number of animation threads currently executing effect logic.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Cancel and join the current routine, then blank the LEDs.
    pub fn shutdown(&self) {
        self.stop();
        self.wait(self.join_timeout);
        self.surface.clear();
    }
}

impl Drop for AnimationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Caller's view of one launched routine.
struct RunTicket {
    cancel: CancelToken,
    result: Arc<Mutex<Option<EffectOutcome>>>,
}

impl RunTicket {
    fn outcome(&self) -> Option<EffectOutcome> {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::led::color::{AMBER, CYAN, OFF};
    use crate::led::pwm::ChannelTargets;

    fn scheduler() -> (Arc<ChannelTargets>, AnimationScheduler) {
        let targets = Arc::new(ChannelTargets::new(3));
        let surface: Arc<dyn LedSurface> = Arc::clone(&targets) as Arc<dyn LedSurface>;
        (targets, AnimationScheduler::new(surface))
    }

    fn endless_pulse(colour: crate::led::Rgb) -> Effect {
        Effect::Pulse {
            colour,
            speed: 40,
            duration: None,
        }
    }

    #[test]
    fn chase_speed_is_clamped() {
        let speed = ChaseSpeed::default();
        assert_eq!(speed.get(), 50);
        speed.set(0);
        assert_eq!(speed.get(), 1);
        speed.set(250);
        assert_eq!(speed.get(), 100);
        assert_eq!(ChaseSpeed::new(0).get(), 1);
    }

    #[test]
    fn replacing_leaves_exactly_one_live_animation() {
        let (_targets, sched) = scheduler();
        sched.start(endless_pulse(CYAN));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(sched.live_count(), 1);

        let started = Instant::now();
        sched.start(endless_pulse(AMBER));
        let replace_took = started.elapsed();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(sched.live_count(), 1);
        assert!(replace_took < POLL_GRANULARITY * 5, "took {replace_took:?}");
        sched.shutdown();
        assert_eq!(sched.live_count(), 0);
    }

    #[test]
    fn stop_then_wait_ends_routine() {
        let (targets, sched) = scheduler();
        sched.start(Effect::RainbowChase {
            speed: None,
            duration: None,
        });
        std::thread::sleep(Duration::from_millis(30));
        assert!(sched.is_running());

        sched.stop();
        assert!(sched.wait(Duration::from_secs(1)));
        assert!(!sched.is_running());
        assert_ne!(targets.rgb(0), OFF);
    }

    #[test]
    fn finite_effect_finishes_on_its_own() {
        let (targets, sched) = scheduler();
        sched.start(Effect::Hold {
            colour: AMBER,
            duration: Duration::from_millis(20),
        });
        assert!(sched.wait(Duration::from_secs(1)));
        assert_eq!(targets.rgb(1), AMBER);
    }

    #[test]
    fn blocking_run_replaces_background_routine() {
        let (targets, sched) = scheduler();
        sched.start(endless_pulse(CYAN));
        std::thread::sleep(Duration::from_millis(30));

        let outcome = sched.run_blocking(&Effect::Solid(AMBER), &CancelToken::new());
        assert_eq!(outcome, EffectOutcome::Finished);
        assert_eq!(sched.live_count(), 0);
        assert_eq!(targets.rgb(2), AMBER);
    }

    /// Surface that records which thread made each write.
    struct WriterLog {
        inner: ChannelTargets,
        writers: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl LedSurface for WriterLog {
        fn led_count(&self) -> usize {
            self.inner.led_count()
        }

        fn set_rgb(&self, led: usize, colour: crate::led::Rgb) {
            self.writers
                .lock()
                .unwrap()
                .push(std::thread::current().id());
            self.inner.set_rgb(led, colour);
        }

        fn rgb(&self, led: usize) -> crate::led::Rgb {
            self.inner.rgb(led)
        }
    }

    #[test]
    fn concurrent_callers_never_write_at_the_same_time() {
        let log = Arc::new(WriterLog {
            inner: ChannelTargets::new(3),
            writers: Mutex::new(Vec::new()),
        });
        let sched = Arc::new(AnimationScheduler::new(
            Arc::clone(&log) as Arc<dyn LedSurface>
        ));

        let other = {
            let sched = Arc::clone(&sched);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                let flash = Effect::Flash {
                    colour: AMBER,
                    times: 3,
                    on: Duration::from_millis(10),
                };
                let outcome = sched.run_blocking(&flash, &CancelToken::new());
                sched.start(Effect::RainbowChase {
                    speed: Some(100),
                    duration: None,
                });
                outcome
            })
        };

        let long_flash = Effect::Flash {
            colour: CYAN,
            times: 10,
            on: Duration::from_millis(20),
        };
        let first = sched.run_blocking(&long_flash, &CancelToken::new());
        let second = other.join().unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(sched.live_count() <= 1);
        sched.shutdown();

        assert_eq!(first, EffectOutcome::Cancelled);
        assert_eq!(second, EffectOutcome::Finished);

        // Once a new writer takes over, earlier ones never write again.
        let writers = log.writers.lock().unwrap().clone();
        let mut seen: Vec<std::thread::ThreadId> = Vec::new();
        for id in writers {
            if seen.last() == Some(&id) {
                continue;
            }
            assert!(!seen.contains(&id), "interleaved writers");
            seen.push(id);
        }
        assert!(seen.len() >= 3);
    }

    #[test]
    fn caller_cancel_ends_a_blocking_run() {
        let (_targets, sched) = scheduler();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            trigger.cancel();
        });

        let outcome = sched.run_blocking(&endless_pulse(CYAN), &cancel);

        assert_eq!(outcome, EffectOutcome::Cancelled);
        assert_eq!(sched.live_count(), 0);
    }

    #[test]
    fn live_chase_follows_speed_changes() {
        let (_targets, sched) = scheduler();
        sched.chase_speed().set(85);
        assert_eq!(sched.chase_speed().get(), 85);
        sched.start(Effect::RainbowChase {
            speed: None,
            duration: None,
        });
        sched.chase_speed().set(100);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sched.chase_speed().get(), 100);
        sched.shutdown();
    }
}
