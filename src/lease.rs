//! Single-instance guard.
//!
//! The lease is a file holding the owner's PID. At startup the file is
//! checked against the process table: a live process whose command line
//! contains the marker means another instance owns the hardware, anything
//! else is a stale lease and is overwritten.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("cannot write lease {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

/// Read access to other processes' command lines.
pub trait ProcessTable {
    /// Command line of `pid` with arguments joined by spaces, or `None` when
    /// no such process exists.
    fn cmdline(&self, pid: u32) -> Option<String>;
}

/// `/proc/<pid>/cmdline`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFs;

impl ProcessTable for ProcFs {
    fn cmdline(&self, pid: u32) -> Option<String> {
        let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
        let text = String::from_utf8_lossy(&raw);
        Some(text.trim_end_matches('\0').replace('\0', " "))
    }
}

// ---------------------------------------------------------------------------
// PidLease
// ---------------------------------------------------------------------------

/// Held for the lifetime of the run. Dropping it removes the file, unless
/// another process has since overwritten it.
#[derive(Debug)]
pub struct PidLease {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl PidLease {
    /// Take the lease for the current process.
    pub fn acquire(
        path: &Path,
        marker: &str,
        processes: &dyn ProcessTable,
    ) -> Result<Self, LeaseError> {
        Self::acquire_as(path, marker, processes, std::process::id())
    }

    fn acquire_as(
        path: &Path,
        marker: &str,
        processes: &dyn ProcessTable,
        own_pid: u32,
    ) -> Result<Self, LeaseError> {
        if let Some(pid) = read_pid(path) {
            let live = pid != own_pid
                && processes
                    .cmdline(pid)
                    .is_some_and(|cmdline| cmdline.contains(marker));
            if live {
                return Err(LeaseError::AlreadyRunning { pid });
            }
            log::info!("[system] reclaiming stale lease from pid {pid}");
        }

        fs::write(path, own_pid.to_string()).map_err(|source| LeaseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("[system] lease {} taken by {own_pid}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            pid: own_pid,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the lease file if it still names us. Later calls do nothing.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if read_pid(&self.path) != Some(self.pid) {
            log::warn!(
                "[system] lease {} no longer ours; leaving it",
                self.path.display()
            );
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => log::info!("[system] lease released"),
            Err(e) => log::warn!("[system] cannot remove {}: {e}", self.path.display()),
        }
    }
}

impl Drop for PidLease {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// FakeProcesses  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use fake::FakeProcesses;

#[cfg(test)]
mod fake {
    use std::collections::HashMap;

    use super::ProcessTable;

    #[derive(Debug, Default)]
    pub struct FakeProcesses(HashMap<u32, String>);

    impl FakeProcesses {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, pid: u32, cmdline: &str) -> Self {
            self.0.insert(pid, cmdline.to_string());
            self
        }
    }

    impl ProcessTable for FakeProcesses {
        fn cmdline(&self, pid: u32) -> Option<String> {
            self.0.get(&pid).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWN: u32 = 4242;

    #[test]
    fn fresh_lease_writes_pid_and_drop_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autorain.pid");
        {
            let lease =
                PidLease::acquire_as(&path, "autorain", &FakeProcesses::new(), OWN).unwrap();
            assert_eq!(lease.pid(), OWN);
            assert_eq!(fs::read_to_string(&path).unwrap(), "4242");
        }
        assert!(!path.exists());
    }

    #[test]
    fn live_matching_owner_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autorain.pid");
        fs::write(&path, "77\n").unwrap();
        let procs = FakeProcesses::new().with(77, "/usr/local/bin/autorain /etc/autorain.toml");

        let err = PidLease::acquire_as(&path, "autorain", &procs, OWN).unwrap_err();

        assert!(matches!(err, LeaseError::AlreadyRunning { pid: 77 }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "77\n");
    }

    #[test]
    fn dead_owner_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autorain.pid");
        fs::write(&path, "77").unwrap();

        let lease = PidLease::acquire_as(&path, "autorain", &FakeProcesses::new(), OWN).unwrap();

        assert_eq!(fs::read_to_string(lease.path()).unwrap(), "4242");
    }

    #[test]
    fn recycled_pid_with_other_program_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autorain.pid");
        fs::write(&path, "77").unwrap();
        let procs = FakeProcesses::new().with(77, "/usr/bin/sshd -D");

        assert!(PidLease::acquire_as(&path, "autorain", &procs, OWN).is_ok());
    }

    #[test]
    fn garbage_lease_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autorain.pid");
        fs::write(&path, "not a pid").unwrap();

        assert!(PidLease::acquire_as(&path, "autorain", &FakeProcesses::new(), OWN).is_ok());
    }

    #[test]
    fn release_leaves_a_lease_taken_over_by_someone_else() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autorain.pid");
        let mut lease =
            PidLease::acquire_as(&path, "autorain", &FakeProcesses::new(), OWN).unwrap();
        fs::write(&path, "99").unwrap();

        lease.release();

        assert_eq!(fs::read_to_string(&path).unwrap(), "99");
    }

    #[test]
    fn unwritable_location_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("autorain.pid");
        assert!(matches!(
            PidLease::acquire_as(&path, "autorain", &FakeProcesses::new(), OWN),
            Err(LeaseError::Io { .. })
        ));
    }

    #[test]
    fn procfs_reads_own_cmdline() {
        let cmdline = ProcFs.cmdline(std::process::id()).unwrap();
        assert!(!cmdline.is_empty());
        assert!(!cmdline.contains('\0'));
    }
}
