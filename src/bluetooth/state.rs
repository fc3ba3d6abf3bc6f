//! Speaker connection bookkeeping for one boot sequence.

use std::time::Instant;

/// Connection flag plus the counters the recovery loop reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BtConnectionState {
    connected: bool,
    last_power_cycle: Option<Instant>,
    power_cycles: u32,
    connect_attempts: u32,
    rounds: u32,
}

impl BtConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&mut self) {
        self.connected = true;
    }

    pub fn on_round(&mut self) {
        self.rounds += 1;
    }

    /// Record a successful relay toggle.
    pub fn on_power_cycle(&mut self, at: Instant) {
        self.power_cycles += 1;
        self.last_power_cycle = Some(at);
    }

    pub fn on_connect_attempt(&mut self) {
        self.connect_attempts += 1;
    }

    #[must_use]
    pub fn connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub fn last_power_cycle(&self) -> Option<Instant> {
        self.last_power_cycle
    }

    #[must_use]
    pub fn power_cycles(&self) -> u32 {
        self.power_cycles
    }

    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    #[must_use]
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Fold the counters of a later round into this state.
    pub fn absorb(&mut self, later: &BtConnectionState) {
        self.connected = later.connected;
        self.power_cycles += later.power_cycles;
        self.connect_attempts += later.connect_attempts;
        self.rounds += later.rounds;
        if later.last_power_cycle.is_some() {
            self.last_power_cycle = later.last_power_cycle;
        }
    }
}
