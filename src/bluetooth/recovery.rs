//! Speaker recovery: power-cycle rounds followed by rapid connect attempts.
//!
//! ```text
//! connected? ──yes──▶ Connected
//!     │no
//!     ▼
//! ┌▶ elapsed ≥ timeout? ──yes──▶ TimedOut (logged once)
//! │   │no
//! │   ▼
//! │  power_cycle → settle → connect × N (disconnect + delay between)
//! │   │ any success ─────────▶ Connected
//! └───┘ all failed
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{BluetoothControl, BtConnectionState};
use crate::cancel::CancelToken;
use crate::config::BluetoothConfig;

// ---------------------------------------------------------------------------
// Policy / report
// ---------------------------------------------------------------------------

/// Timing of one recovery run.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    /// Overall bound; no new round or attempt starts after it elapses.
    pub timeout: Duration,
    /// Wait after a relay toggle before connecting.
    pub boot_settle: Duration,
    /// Connect attempts per round.
    pub rapid_attempts: u32,
    /// Pause after a failed connect attempt.
    pub attempt_delay: Duration,
}

impl RecoveryPolicy {
    /// Policy of the blocking startup variant.
    pub fn startup(cfg: &BluetoothConfig) -> Self {
        Self::with_timeout(cfg, Duration::from_secs(cfg.startup_timeout_secs))
    }

    /// Policy of one background round.
    pub fn background(cfg: &BluetoothConfig) -> Self {
        Self::with_timeout(cfg, Duration::from_secs(cfg.background_timeout_secs))
    }

    fn with_timeout(cfg: &BluetoothConfig, timeout: Duration) -> Self {
        Self {
            timeout,
            boot_settle: Duration::from_secs_f32(cfg.boot_settle_secs.max(0.0)),
            rapid_attempts: cfg.rapid_attempts.max(1),
            attempt_delay: Duration::from_millis(cfg.attempt_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Connected,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub outcome: RecoveryOutcome,
    pub state: BtConnectionState,
    pub elapsed: Duration,
}

impl RecoveryReport {
    pub fn connected(&self) -> bool {
        self.outcome == RecoveryOutcome::Connected
    }
}

// ---------------------------------------------------------------------------
// Blocking variant
// ---------------------------------------------------------------------------

/// Run recovery on the calling thread until connected, timed out or
/// cancelled.
pub fn recover_blocking(
    ctl: &dyn BluetoothControl,
    device: &str,
    policy: &RecoveryPolicy,
    cancel: &CancelToken,
) -> RecoveryReport {
    let started = Instant::now();
    let mut state = BtConnectionState::new();
    let report = |outcome, state: BtConnectionState| RecoveryReport {
        outcome,
        state,
        elapsed: started.elapsed(),
    };

    if ctl.is_connected(device) {
        log::info!("[bt] speaker already connected");
        state.on_connected();
        return report(RecoveryOutcome::Connected, state);
    }

    loop {
        if cancel.is_cancelled() {
            return report(RecoveryOutcome::Cancelled, state);
        }
        if started.elapsed() >= policy.timeout {
            log::warn!(
                "[bt] speaker not connected after {:?} ({} rounds, {} attempts)",
                policy.timeout,
                state.rounds(),
                state.connect_attempts()
            );
            return report(RecoveryOutcome::TimedOut, state);
        }

        state.on_round();
        if ctl.power_cycle() {
            state.on_power_cycle(Instant::now());
        } else {
            log::warn!("[bt] power cycle failed; trying to connect anyway");
        }
        if !cancel.sleep(policy.boot_settle) {
            return report(RecoveryOutcome::Cancelled, state);
        }

        for attempt in 1..=policy.rapid_attempts {
            if started.elapsed() >= policy.timeout {
                break;
            }
            state.on_connect_attempt();
            if ctl.connect(device) {
                log::info!(
                    "[bt] speaker connected (round {}, attempt {attempt})",
                    state.rounds()
                );
                state.on_connected();
                return report(RecoveryOutcome::Connected, state);
            }
            log::debug!("[bt] connect attempt {attempt} failed");
            ctl.disconnect(device);
            if !cancel.sleep(policy.attempt_delay) {
                return report(RecoveryOutcome::Cancelled, state);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background variant
// ---------------------------------------------------------------------------

/// Recovery rounds on a dedicated thread, repeated every `interval` until
/// the speaker connects or the handle is stopped.
pub struct BackgroundRecovery {
    cancel: CancelToken,
    thread: Option<JoinHandle<BtConnectionState>>,
}

impl BackgroundRecovery {
    /// Start the loop. `on_connect` runs once, on the recovery thread, right
    /// after the speaker connects, and receives the loop's cancel token so
    /// any waiting it does ends with [`stop`](Self::stop). It is skipped when
    /// the stop request arrives first.
    pub fn spawn<F>(
        ctl: Arc<dyn BluetoothControl>,
        device: String,
        policy: RecoveryPolicy,
        interval: Duration,
        on_connect: F,
    ) -> std::io::Result<Self>
    where
        F: FnOnce(&CancelToken) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("bt-recovery".into())
            .spawn(move || {
                let mut total = BtConnectionState::new();
                log::info!("[bt] background recovery started");
                loop {
                    let report = recover_blocking(ctl.as_ref(), &device, &policy, &token);
                    total.absorb(&report.state);
                    match report.outcome {
                        RecoveryOutcome::Connected => {
                            if token.is_cancelled() {
                                log::info!("[bt] connected after stop; skipping callback");
                            } else {
                                on_connect(&token);
                            }
                            break;
                        }
                        RecoveryOutcome::Cancelled => break,
                        RecoveryOutcome::TimedOut => {
                            log::info!("[bt] next background round in {interval:?}");
                            if !token.sleep(interval) {
                                break;
                            }
                        }
                    }
                }
                log::info!("[bt] background recovery finished");
                total
            })?;
        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the loop and wait up to `timeout` for it to end. Returns the
    /// accumulated state when the thread was joined.
    pub fn stop(&mut self, timeout: Duration) -> Option<BtConnectionState> {
        self.cancel.cancel();
        let deadline = Instant::now() + timeout;
        let thread = self.thread.take()?;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                log::warn!("[bt] recovery thread still busy after {timeout:?}; detaching");
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        thread.join().ok()
    }
}

impl Drop for BackgroundRecovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::FakeBluetooth;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn policy(timeout_ms: u64) -> RecoveryPolicy {
        RecoveryPolicy {
            timeout: Duration::from_millis(timeout_ms),
            boot_settle: Duration::from_millis(30),
            rapid_attempts: 3,
            attempt_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn already_connected_returns_at_once() {
        let fake = FakeBluetooth::connected();
        let report = recover_blocking(&fake, "dev", &policy(1_000), &CancelToken::new());
        assert!(report.connected());
        assert_eq!(fake.power_cycles(), 0);
        assert_eq!(fake.connects(), 0);
    }

    #[test]
    fn connects_on_a_later_attempt() {
        let fake = FakeBluetooth::connecting_after(2);
        let report = recover_blocking(&fake, "dev", &policy(2_000), &CancelToken::new());
        assert!(report.connected());
        assert_eq!(report.state.connect_attempts(), 3);
        assert_eq!(fake.power_cycles(), 1);
        assert_eq!(fake.disconnects(), 2);
    }

    #[test]
    fn never_connecting_speaker_times_out_within_one_round() {
        let fake = FakeBluetooth::never_connecting();
        let p = policy(200);
        let round = p.boot_settle + p.attempt_delay * p.rapid_attempts;

        let report = recover_blocking(&fake, "dev", &p, &CancelToken::new());

        assert_eq!(report.outcome, RecoveryOutcome::TimedOut);
        assert!(report.elapsed >= p.timeout);
        assert!(
            report.elapsed < p.timeout + round + Duration::from_millis(50),
            "elapsed {:?}",
            report.elapsed
        );
        assert!(report.state.rounds() >= 2);
        assert_eq!(report.state.power_cycles(), fake.power_cycles());
    }

    #[test]
    fn failed_power_cycle_still_attempts_connect() {
        let fake = FakeBluetooth::connecting_after(0);
        fake.set_power_cycle_ok(false);
        let report = recover_blocking(&fake, "dev", &policy(1_000), &CancelToken::new());
        assert!(report.connected());
        assert_eq!(report.state.power_cycles(), 0);
    }

    #[test]
    fn cancel_interrupts_settle_delay() {
        let fake = FakeBluetooth::never_connecting();
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            remote.cancel();
        });
        let mut p = policy(10_000);
        p.boot_settle = Duration::from_secs(5);

        let report = recover_blocking(&fake, "dev", &p, &cancel);
        canceller.join().unwrap();

        assert_eq!(report.outcome, RecoveryOutcome::Cancelled);
        assert!(report.elapsed < Duration::from_secs(1));
    }

    #[test]
    fn background_runs_callback_once_connected() {
        let fake = Arc::new(FakeBluetooth::connecting_after(4));
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);

        let mut bg = BackgroundRecovery::spawn(
            fake.clone(),
            "dev".into(),
            policy(60),
            Duration::from_millis(20),
            move |_: &CancelToken| flag.store(true, Ordering::SeqCst),
        )
        .unwrap();

        let state = bg.stop_after_finish(Duration::from_secs(3));
        assert!(called.load(Ordering::SeqCst));
        assert!(state.connected());
        assert_eq!(state.connect_attempts(), 5);
    }

    #[test]
    fn background_stops_on_request() {
        let fake = Arc::new(FakeBluetooth::never_connecting());
        let mut bg = BackgroundRecovery::spawn(
            fake,
            "dev".into(),
            policy(50),
            Duration::from_secs(10),
            |_: &CancelToken| panic!("must not connect"),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(120));
        let state = bg.stop(Duration::from_secs(1)).unwrap();
        assert!(!state.connected());
        assert!(bg.is_finished());
    }

    #[test]
    fn stop_reaches_a_running_callback() {
        let fake = Arc::new(FakeBluetooth::connected());
        let entered = Arc::new(AtomicBool::new(false));
        let waited_out = Arc::new(AtomicBool::new(false));
        let (entered_flag, waited_flag) = (Arc::clone(&entered), Arc::clone(&waited_out));

        let mut bg = BackgroundRecovery::spawn(
            fake,
            "dev".into(),
            policy(1_000),
            Duration::from_secs(10),
            move |token: &CancelToken| {
                entered_flag.store(true, Ordering::SeqCst);
                // Stands in for the sink wait.
                waited_flag.store(token.sleep(Duration::from_secs(5)), Ordering::SeqCst);
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !entered.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(entered.load(Ordering::SeqCst));

        let started = Instant::now();
        let state = bg.stop(Duration::from_secs(1));

        assert!(state.is_some_and(|s| s.connected()));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!waited_out.load(Ordering::SeqCst));
    }

    impl BackgroundRecovery {
        fn stop_after_finish(&mut self, limit: Duration) -> BtConnectionState {
            let deadline = Instant::now() + limit;
            while !self.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            self.stop(Duration::from_secs(1)).unwrap()
        }
    }
}
