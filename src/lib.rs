//! autorain: unattended palera1n provisioning with audio and LED status.
//!
//! The binary in `main.rs` wires logging, configuration and signals, then
//! hands over to [`boot::run`].

pub mod audio;
pub mod automation;
pub mod bluetooth;
pub mod boot;
pub mod cancel;
pub mod config;
pub mod feedback;
pub mod lease;
pub mod led;
pub mod system;
