//! One supervised run of the external tool.
//!
//! [`StateMachine::run_attempt`] owns the session for the whole attempt and
//! closes it on every exit path. It waits for the next [`Signal`], reacts
//! and returns one of three outcomes:
//!
//! | Signal / event | Feedback | Action | Outcome |
//! |----------------|----------|--------|---------|
//! | device waiting | `DeviceWaiting` | | continue |
//! | recovery entered | `DeviceDetected` | send Enter | continue |
//! | DFU prompt | `DfuHold`, `DfuRelease` | send Enter between | continue |
//! | kernel booting / PongoOS | `Booting` | | `Success` |
//! | download-mode timeout | `Retry` | close | `Retry` |
//! | normal mode | | | continue |
//! | end of output | `Fault` | | `Retry` |
//! | no signal within timeout | `Fault` | | `Retry` |
//! | interrupt | | | `Interrupted` |

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::session::{ReadEvent, ToolSession};
use super::signal::{PatternTable, Signal, SignalScanner};
use super::state::{SessionPhase, SharedPhase};
use crate::cancel::CancelToken;
use crate::feedback::{Feedback, FeedbackEvent};

/// Longest single blocking read, so interrupts are seen promptly.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Keystroke that answers the tool's "press Enter" prompts. `send_line`
/// appends the newline, so the tool sees CR LF.
const ENTER: &str = "\r";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why an attempt asked for a respawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    DownloadTimeout,
    Exited,
    Inactivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(Signal),
    Retry(RetryCause),
    Interrupted,
}

/// What waiting on the tool produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Signal(Signal),
    Closed,
    TimedOut,
    Interrupted,
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

pub struct StateMachine {
    table: PatternTable,
    feedback: Arc<dyn Feedback>,
    inactivity_timeout: Duration,
    interrupt: CancelToken,
    phase: SharedPhase,
}

impl StateMachine {
    pub fn new(
        table: PatternTable,
        feedback: Arc<dyn Feedback>,
        inactivity_timeout: Duration,
        interrupt: CancelToken,
        phase: SharedPhase,
    ) -> Self {
        Self {
            table,
            feedback,
            inactivity_timeout,
            interrupt,
            phase,
        }
    }

    pub fn phase(&self) -> &SharedPhase {
        &self.phase
    }

    /// Drive `session` until it succeeds, needs a respawn or is interrupted.
    pub fn run_attempt(&self, mut session: Box<dyn ToolSession>) -> AttemptOutcome {
        let mut scanner = SignalScanner::new(self.table.clone());
        let outcome = self.drive(session.as_mut(), &mut scanner);
        session.close();
        outcome
    }

    fn drive(&self, session: &mut dyn ToolSession, scanner: &mut SignalScanner) -> AttemptOutcome {
        loop {
            let signal = match self.next_event(session, scanner) {
                SessionEvent::Signal(signal) => signal,
                SessionEvent::Closed => {
                    log::error!("[tool] exited unexpectedly");
                    self.feedback.emit(FeedbackEvent::Fault);
                    return AttemptOutcome::Retry(RetryCause::Exited);
                }
                SessionEvent::TimedOut => {
                    log::error!(
                        "[tool] no progress within {:?}",
                        self.inactivity_timeout
                    );
                    self.feedback.emit(FeedbackEvent::Fault);
                    return AttemptOutcome::Retry(RetryCause::Inactivity);
                }
                SessionEvent::Interrupted => return AttemptOutcome::Interrupted,
            };

            if let Some(next) = SessionPhase::after(signal) {
                self.phase.set(next);
            }

            match signal {
                Signal::DeviceWaiting => {
                    log::info!("[tool] waiting for device");
                    self.feedback.emit(FeedbackEvent::DeviceWaiting);
                }
                Signal::RecoveryEntered => {
                    log::info!("[tool] recovery mode detected; advancing");
                    self.feedback.emit(FeedbackEvent::DeviceDetected);
                    self.press_enter(session);
                }
                Signal::DfuPrompt => {
                    log::info!("[tool] DFU sequence");
                    self.feedback.emit(FeedbackEvent::DfuHold);
                    self.press_enter(session);
                    self.feedback.emit(FeedbackEvent::DfuRelease);
                }
                Signal::KernelBooting | Signal::PongoFound => {
                    log::info!("[tool] {signal} detected");
                    self.feedback.emit(FeedbackEvent::Booting);
                    return AttemptOutcome::Success(signal);
                }
                Signal::DownloadTimeout => {
                    log::warn!("[tool] download-mode timeout; retrying");
                    self.feedback.emit(FeedbackEvent::Retry);
                    session.close();
                    return AttemptOutcome::Retry(RetryCause::DownloadTimeout);
                }
                Signal::NormalMode => {
                    log::info!("[tool] device in normal mode; it will reboot to recovery");
                }
            }
        }
    }

    /// Wait for the next signal, bounded by the inactivity timeout.
    pub fn next_event(
        &self,
        session: &mut dyn ToolSession,
        scanner: &mut SignalScanner,
    ) -> SessionEvent {
        let deadline = Instant::now() + self.inactivity_timeout;
        loop {
            if let Some(signal) = scanner.next_signal() {
                return SessionEvent::Signal(signal);
            }
            if self.interrupt.is_cancelled() {
                return SessionEvent::Interrupted;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return SessionEvent::TimedOut;
            }
            match session.read(remaining.min(READ_SLICE)) {
                ReadEvent::Data(text) => scanner.push(&text),
                ReadEvent::Idle => {}
                ReadEvent::Closed => {
                    return match scanner.next_signal() {
                        Some(signal) => SessionEvent::Signal(signal),
                        None => SessionEvent::Closed,
                    };
                }
            }
        }
    }

    fn press_enter(&self, session: &mut dyn ToolSession) {
        if let Err(e) = session.send_line(ENTER) {
            log::warn!("[tool] {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
