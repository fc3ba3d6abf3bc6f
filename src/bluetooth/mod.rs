//! Bluetooth speaker link: control surface, state and recovery loop.
//!
//! The speaker is an unreliable A2DP sink behind a power relay. Recovery
//! toggles the relay and retries connects; see [`recovery`] for the loop and
//! [`BluetoothCtl`] for the `bluetoothctl` implementation.

pub mod ctl;
pub mod recovery;
pub mod state;

pub use ctl::BluetoothCtl;
pub use recovery::{
    recover_blocking, BackgroundRecovery, RecoveryOutcome, RecoveryPolicy, RecoveryReport,
};
pub use state::BtConnectionState;

/// The operations recovery needs from the OS Bluetooth stack and the relay.
///
/// `device` is the speaker's MAC address.
pub trait BluetoothControl: Send + Sync {
    fn is_connected(&self, device: &str) -> bool;

    /// Attempt one connect. `true` once the link is up.
    fn connect(&self, device: &str) -> bool;

    fn disconnect(&self, device: &str);

    /// Toggle the speaker's power relay. `true` when the toggle succeeded.
    fn power_cycle(&self) -> bool;

    fn power_off(&self);
}

// ---------------------------------------------------------------------------
// FakeBluetooth  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use fake::FakeBluetooth;

#[cfg(test)]
mod fake {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::BluetoothControl;

    /// Scripted speaker: connects on attempt `succeed_after + 1`, or never.
    #[derive(Debug, Default)]
    pub struct FakeBluetooth {
        connected: AtomicBool,
        succeed_after: Option<u32>,
        power_cycle_fails: AtomicBool,
        connects: AtomicU32,
        disconnects: AtomicU32,
        power_cycles: AtomicU32,
        power_offs: AtomicU32,
    }

    impl FakeBluetooth {
        pub fn connected() -> Self {
            let fake = Self::never_connecting();
            fake.connected.store(true, Ordering::SeqCst);
            fake
        }

        pub fn never_connecting() -> Self {
            Self::default()
        }

        pub fn connecting_after(failures: u32) -> Self {
            Self {
                succeed_after: Some(failures),
                ..Self::default()
            }
        }

        pub fn set_power_cycle_ok(&self, ok: bool) {
            self.power_cycle_fails.store(!ok, Ordering::SeqCst);
        }

        pub fn connects(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn disconnects(&self) -> u32 {
            self.disconnects.load(Ordering::SeqCst)
        }

        pub fn power_cycles(&self) -> u32 {
            self.power_cycles.load(Ordering::SeqCst)
        }

        pub fn power_offs(&self) -> u32 {
            self.power_offs.load(Ordering::SeqCst)
        }
    }

    impl BluetoothControl for FakeBluetooth {
        fn is_connected(&self, _device: &str) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn connect(&self, _device: &str) -> bool {
            let before = self.connects.fetch_add(1, Ordering::SeqCst);
            let ok = self.succeed_after.is_some_and(|n| before >= n);
            if ok {
                self.connected.store(true, Ordering::SeqCst);
            }
            ok
        }

        fn disconnect(&self, _device: &str) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }

        fn power_cycle(&self) -> bool {
            if self.power_cycle_fails.load(Ordering::SeqCst) {
                return false;
            }
            self.power_cycles.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn power_off(&self) {
            self.power_offs.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}
