//! Typed signals recognised in the tool's output.
//!
//! [`PatternTable`] is the only place that knows the tool's raw text. The
//! [`SignalScanner`] keeps a rolling buffer of output so a marker split
//! across reads, or printed without a trailing newline, is still found.

use std::fmt;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    DeviceWaiting,
    RecoveryEntered,
    DfuPrompt,
    KernelBooting,
    PongoFound,
    DownloadTimeout,
    NormalMode,
}

impl Signal {
    /// `true` for the markers that end a run successfully.
    pub fn is_success(self) -> bool {
        matches!(self, Signal::KernelBooting | Signal::PongoFound)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Signal::DeviceWaiting => "device waiting",
            Signal::RecoveryEntered => "recovery mode entered",
            Signal::DfuPrompt => "DFU prompt",
            Signal::KernelBooting => "kernel booting",
            Signal::PongoFound => "PongoOS found",
            Signal::DownloadTimeout => "download-mode timeout",
            Signal::NormalMode => "normal mode",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// PatternTable
// ---------------------------------------------------------------------------

/// Substring → signal mapping. Earlier entries win ties at the same offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternTable {
    entries: Vec<(String, Signal)>,
}

impl Default for PatternTable {
    fn default() -> Self {
        Self::new(vec![
            ("Waiting for devices".into(), Signal::DeviceWaiting),
            ("Entering recovery mode".into(), Signal::RecoveryEntered),
            ("Press Enter when ready for DFU".into(), Signal::DfuPrompt),
            ("Booting Kernel".into(), Signal::KernelBooting),
            ("Found PongoOS USB Device".into(), Signal::PongoFound),
            (
                "Timed out waiting for download mode".into(),
                Signal::DownloadTimeout,
            ),
            ("Entering normal mode".into(), Signal::NormalMode),
        ])
    }
}

impl PatternTable {
    /// Empty patterns are dropped.
    pub fn new(entries: Vec<(String, Signal)>) -> Self {
        Self {
            entries: entries.into_iter().filter(|(p, _)| !p.is_empty()).collect(),
        }
    }

    /// Length in bytes of the longest pattern.
    pub fn longest(&self) -> usize {
        self.entries.iter().map(|(p, _)| p.len()).max().unwrap_or(0)
    }

    /// Earliest match in `text` as `(signal, end offset)`.
    pub fn earliest(&self, text: &str) -> Option<(Signal, usize)> {
        self.entries
            .iter()
            .filter_map(|(pattern, signal)| {
                text.find(pattern.as_str())
                    .map(|start| (start, start + pattern.len(), *signal))
            })
            .min_by_key(|&(start, _, _)| start)
            .map(|(_, end, signal)| (signal, end))
    }
}

// ---------------------------------------------------------------------------
// SignalScanner
// ---------------------------------------------------------------------------

/// Rolling-buffer matcher over raw tool output.
#[derive(Debug, Clone)]
pub struct SignalScanner {
    table: PatternTable,
    buffer: String,
}

impl SignalScanner {
    pub fn new(table: PatternTable) -> Self {
        Self {
            table,
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
    }

    /// Pop the earliest signal in the buffer, consuming text up to the end
    /// of its match.
    ///
    /// When nothing matches, only a tail short enough to be the start of a
    /// pattern is kept, so the buffer stays bounded.
    pub fn next_signal(&mut self) -> Option<Signal> {
        if let Some((signal, end)) = self.table.earliest(&self.buffer) {
            self.buffer.drain(..end);
            return Some(signal);
        }
        self.trim();
        None
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn trim(&mut self) {
        let keep = self.table.longest().saturating_sub(1);
        if self.buffer.len() <= keep {
            return;
        }
        let mut cut = self.buffer.len() - keep;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }
}

impl Default for SignalScanner {
    fn default() -> Self {
        Self::new(PatternTable::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
