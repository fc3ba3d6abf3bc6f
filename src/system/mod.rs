//! Host integration: power-off, teardown registry, helper processes.

pub mod process;
pub mod shutdown;
pub mod teardown;

pub use process::{kill_by_name, reap, ProcessError, Usbmuxd};
pub use shutdown::{CommandShutdown, Shutdown, ShutdownOnce};
pub use teardown::{Release, Teardown};

#[cfg(test)]
pub use shutdown::CountingShutdown;
