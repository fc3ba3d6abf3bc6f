//! Automation phase and the shared handle other threads read it through.
//!
//! [`SessionPhase`] is advanced by the state-machine thread only. The
//! orchestrator reads it through [`SharedPhase`] to report where a run
//! ended.

use std::sync::{Arc, Mutex, PoisonError};

use super::signal::Signal;

// ---------------------------------------------------------------------------
// SessionPhase
// ---------------------------------------------------------------------------

/// Where the current run is in the provisioning handshake.
///
/// ```text
/// Idle ──spawn──▶ Spawning ──"Waiting for devices"──▶ WaitingForDevice
///      ──"Entering recovery mode"──▶ Recovery
///      ──"Press Enter when ready for DFU"──▶ Dfu
///      ──"Booting Kernel" / PongoOS──▶ Booting ──▶ Complete
/// any ──timeout / exit──▶ Retrying ──respawn──▶ Spawning
/// Retrying ──budget exhausted──▶ Failed
/// any ──SIGINT / SIGTERM──▶ Interrupted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Spawning,
    WaitingForDevice,
    Recovery,
    Dfu,
    Booting,
    Retrying,
    Complete,
    Failed,
    Interrupted,
}

impl SessionPhase {
    /// Phase entered when `signal` is observed. `None` for signals that do
    /// not move the handshake (normal mode, download timeout).
    pub fn after(signal: Signal) -> Option<Self> {
        match signal {
            Signal::DeviceWaiting => Some(SessionPhase::WaitingForDevice),
            Signal::RecoveryEntered => Some(SessionPhase::Recovery),
            Signal::DfuPrompt => Some(SessionPhase::Dfu),
            Signal::KernelBooting | Signal::PongoFound => Some(SessionPhase::Booting),
            Signal::DownloadTimeout | Signal::NormalMode => None,
        }
    }

    /// `true` once no further spawn will happen.
    ///
    /// ```
    /// use autorain::automation::SessionPhase;
    ///
    /// assert!(SessionPhase::Complete.is_terminal());
    /// assert!(SessionPhase::Failed.is_terminal());
    /// assert!(!SessionPhase::Retrying.is_terminal());
    /// ```
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Complete | SessionPhase::Failed | SessionPhase::Interrupted
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Spawning => "spawning",
            SessionPhase::WaitingForDevice => "waiting for device",
            SessionPhase::Recovery => "recovery",
            SessionPhase::Dfu => "DFU",
            SessionPhase::Booting => "booting",
            SessionPhase::Retrying => "retrying",
            SessionPhase::Complete => "complete",
            SessionPhase::Failed => "failed",
            SessionPhase::Interrupted => "interrupted",
        }
    }
}

// ---------------------------------------------------------------------------
// SharedPhase
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle to the current [`SessionPhase`].
#[derive(Debug, Clone, Default)]
pub struct SharedPhase(Arc<Mutex<SessionPhase>>);

impl SharedPhase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> SessionPhase {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, logging the transition when it changes the phase.
    pub fn set(&self, next: SessionPhase) {
        let mut phase = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != next {
            log::info!("phase: {} → {}", phase.label(), next.label());
            *phase = next;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
