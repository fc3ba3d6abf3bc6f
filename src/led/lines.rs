//! Binary output lines driving the LED channels.
//!
//! [`HardwareLines`] is the narrow seam between the PWM engine and the
//! kernel. [`GpioLines`] requests every line once through the GPIO character
//! device (`gpio-cdev`); [`NullLines`] accepts every write and is what the
//! engine runs on when the chip cannot be opened.

use std::collections::HashMap;

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use thiserror::Error;

/// Kernel line offset on the GPIO chip.
pub type LineId = u32;

// ---------------------------------------------------------------------------
// LineError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LineError {
    #[error("cannot open GPIO chip {path}: {source}")]
    Open {
        path: String,
        source: gpio_cdev::Error,
    },

    #[error("cannot request line {line}: {source}")]
    Request {
        line: LineId,
        source: gpio_cdev::Error,
    },

    #[error("cannot write line {line}: {source}")]
    Write {
        line: LineId,
        source: gpio_cdev::Error,
    },

    #[error("line {0} was not requested by this interface")]
    Unknown(LineId),
}

// ---------------------------------------------------------------------------
// HardwareLines trait
// ---------------------------------------------------------------------------

/// Thread-safe batch interface to binary output lines.
///
/// Implementations must tolerate concurrent `set` calls on distinct lines
/// from the per-channel PWM threads.
pub trait HardwareLines: Send + Sync {
    /// Drive a single line active (`true`) or inactive.
    fn set(&self, line: LineId, active: bool) -> Result<(), LineError>;

    /// Drive several lines. Every write is attempted; the first error is
    /// returned.
    fn set_many(&self, values: &[(LineId, bool)]) -> Result<(), LineError> {
        let mut first_err = None;
        for &(line, active) in values {
            if let Err(e) = self.set(line, active) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// NullLines
// ---------------------------------------------------------------------------

/// Accepts and discards every write.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLines;

impl HardwareLines for NullLines {
    fn set(&self, _line: LineId, _active: bool) -> Result<(), LineError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GpioLines
// ---------------------------------------------------------------------------

/// Output lines requested from a Linux GPIO chip, all initially inactive.
///
/// Dropping the value releases the kernel line requests.
pub struct GpioLines {
    chip_path: String,
    handles: HashMap<LineId, LineHandle>,
}

impl std::fmt::Debug for GpioLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpioLines")
            .field("chip_path", &self.chip_path)
            .field("lines", &self.handles.len())
            .finish()
    }
}

impl GpioLines {
    /// Open `chip_path` and request every offset in `lines` as an output.
    ///
    /// Lines still exported through the legacy sysfs interface are
    /// unexported first so the request does not fail with `EBUSY`.
    pub fn open(chip_path: &str, lines: &[LineId], consumer: &str) -> Result<Self, LineError> {
        release_sysfs_exports(lines);

        let mut chip = Chip::new(chip_path).map_err(|source| LineError::Open {
            path: chip_path.to_string(),
            source,
        })?;

        let mut handles = HashMap::with_capacity(lines.len());
        for &line in lines {
            let handle = chip
                .get_line(line)
                .and_then(|l| l.request(LineRequestFlags::OUTPUT, 0, consumer))
                .map_err(|source| LineError::Request { line, source })?;
            handles.insert(line, handle);
        }

        log::info!("[led] requested {} lines on {chip_path}", handles.len());
        Ok(Self {
            chip_path: chip_path.to_string(),
            handles,
        })
    }
}

impl HardwareLines for GpioLines {
    fn set(&self, line: LineId, active: bool) -> Result<(), LineError> {
        let handle = self.handles.get(&line).ok_or(LineError::Unknown(line))?;
        handle
            .set_value(u8::from(active))
            .map_err(|source| LineError::Write { line, source })
    }
}

impl Drop for GpioLines {
    fn drop(&mut self) {
        for (&line, handle) in &self.handles {
            if let Err(e) = handle.set_value(0) {
                log::debug!("[led] line {line} not cleared on release: {e}");
            }
        }
    }
}

/// Best-effort unexport of lines a previous sysfs user left claimed.
fn release_sysfs_exports(lines: &[LineId]) {
    for line in lines {
        let _ = std::fs::write("/sys/class/gpio/unexport", line.to_string());
    }
}

// ---------------------------------------------------------------------------
// RecordingLines  (test-only)
// ---------------------------------------------------------------------------

/// Test double that records every successful write and can be switched into
/// a failing mode.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingLines {
    writes: std::sync::Mutex<Vec<(LineId, bool)>>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<(LineId, bool)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_for(&self, line: LineId) -> Vec<bool> {
        self.writes()
            .into_iter()
            .filter(|(l, _)| *l == line)
            .map(|(_, v)| v)
            .collect()
    }

    /// Last value written to `line`, if any.
    pub fn level(&self, line: LineId) -> Option<bool> {
        self.writes_for(line).last().copied()
    }
}

#[cfg(test)]
impl HardwareLines for RecordingLines {
    fn set(&self, line: LineId, active: bool) -> Result<(), LineError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(LineError::Unknown(line));
        }
        self.writes.lock().unwrap().push((line, active));
        Ok(())
    }
}
