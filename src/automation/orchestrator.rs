//! Retry and escalation: bounds respawns and owns the terminal
//! paths.
//!
//! # Flow
//!
//! ```text
//! loop
//!   spawn ──Err──▶ Fault feedback, retries += 1
//!     └─Ok─▶ StateMachine::run_attempt
//!              ├─ Success     ─────────────▶ Complete feedback → teardown → shutdown
//!              ├─ Retry       → retries += 1
//!              └─ Interrupted ─────────────▶ teardown (no shutdown)
//!   retries > max_retries ─────────────────▶ Failed feedback → teardown → shutdown
//!   wait respawn delay
//! ```
//!
//! At most `max_retries + 1` sessions are spawned per run, and the
//! shutdown is requested at most once.

use std::sync::Arc;
use std::time::Duration;

use super::machine::{AttemptOutcome, StateMachine};
use super::session::ToolSpawner;
use super::state::SessionPhase;
use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::feedback::{Feedback, FeedbackEvent};
use crate::system::{Shutdown, ShutdownOnce, Teardown};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Exhausted,
    Interrupted,
}

/// What a run did, for logging and the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Spawn attempts, failed spawns included.
    pub attempts: u32,
    pub retries: u32,
    pub shutdown_requested: bool,
    /// Phase the handshake had reached when the run ended.
    pub last_phase: SessionPhase,
}

/// Respawn budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub respawn_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            respawn_delay: cfg.respawn_delay(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    spawner: Arc<dyn ToolSpawner>,
    machine: StateMachine,
    feedback: Arc<dyn Feedback>,
    policy: RetryPolicy,
    teardown: Arc<Teardown>,
    shutdown: ShutdownOnce,
    interrupt: CancelToken,
}

impl Orchestrator {
    pub fn new(
        spawner: Arc<dyn ToolSpawner>,
        machine: StateMachine,
        feedback: Arc<dyn Feedback>,
        policy: RetryPolicy,
        teardown: Arc<Teardown>,
        shutdown: Arc<dyn Shutdown>,
        interrupt: CancelToken,
    ) -> Self {
        Self {
            spawner,
            machine,
            feedback,
            policy,
            teardown,
            shutdown: ShutdownOnce::new(shutdown),
            interrupt,
        }
    }

    /// Run attempts until success, exhaustion or interrupt, then take the
    /// matching terminal path.
    pub fn run(&self) -> RunSummary {
        let phase = self.machine.phase();
        let mut attempts = 0;
        let mut retries = 0;

        let outcome = loop {
            if self.interrupt.is_cancelled() {
                break RunOutcome::Interrupted;
            }

            attempts += 1;
            phase.set(SessionPhase::Spawning);
            log::info!(
                "[tool] attempt {attempts} of {}",
                self.policy.max_retries + 1
            );

            match self.spawner.spawn() {
                Err(e) => {
                    log::error!("[tool] {e}");
                    self.feedback.emit(FeedbackEvent::Fault);
                    retries += 1;
                }
                Ok(session) => match self.machine.run_attempt(session) {
                    AttemptOutcome::Success(signal) => {
                        log::info!("[tool] success on {signal}");
                        break RunOutcome::Success;
                    }
                    AttemptOutcome::Retry(cause) => {
                        log::warn!("[tool] attempt {attempts} ended: {cause:?}");
                        retries += 1;
                    }
                    AttemptOutcome::Interrupted => break RunOutcome::Interrupted,
                },
            }

            if retries > self.policy.max_retries {
                break RunOutcome::Exhausted;
            }
            phase.set(SessionPhase::Retrying);
            log::info!(
                "[tool] respawning in {:?} (retry {retries}/{})",
                self.policy.respawn_delay,
                self.policy.max_retries
            );
            if !self.interrupt.sleep(self.policy.respawn_delay) {
                break RunOutcome::Interrupted;
            }
        };

        let last_phase = phase.get();
        self.finish(outcome);
        RunSummary {
            outcome,
            attempts,
            retries,
            shutdown_requested: self.shutdown.fired(),
            last_phase,
        }
    }

    fn finish(&self, outcome: RunOutcome) {
        let phase = self.machine.phase();
        match outcome {
            RunOutcome::Success => {
                phase.set(SessionPhase::Complete);
                log::info!("[system] provisioning complete");
                self.feedback.emit(FeedbackEvent::Complete);
                self.teardown.run();
                self.shutdown.power_off();
            }
            RunOutcome::Exhausted => {
                phase.set(SessionPhase::Failed);
                log::error!(
                    "[system] giving up after {} retries; shutting down",
                    self.policy.max_retries
                );
                self.feedback.emit(FeedbackEvent::Failed);
                self.teardown.run();
                self.shutdown.power_off();
            }
            RunOutcome::Interrupted => {
                log::warn!(
                    "[system] interrupted while {}; tearing down without power-off",
                    phase.get().label()
                );
                phase.set(SessionPhase::Interrupted);
                self.teardown.run();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
