//! External tool sessions on a pseudo-terminal.
//!
//! ```text
//! PtySpawner::spawn ──▶ PtySession
//!                         ├── child process (slave side of the PTY)
//!                         ├── writer         send_line()
//!                         └── reader thread ─▶ mpsc ─▶ read(wait)
//!                               logs every output line under `autorain::tool`
//! ```
//!
//! A session is closed exactly once: explicitly through
//! [`ToolSession::close`] or implicitly on drop.

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use crate::config::ToolConfig;

/// Log target of the tool's own output.
pub const TOOL_LOG_TARGET: &str = "autorain::tool";

// ---------------------------------------------------------------------------
// Errors / events
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tool command is empty")]
    EmptyCommand,

    #[error("cannot open pseudo-terminal: {0}")]
    Pty(String),

    #[error("cannot start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("cannot write to tool: {0}")]
    Write(#[from] std::io::Error),

    #[error("session already closed")]
    Closed,
}

/// Result of one bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Data(String),
    /// Nothing arrived within the wait.
    Idle,
    /// The tool closed its side of the terminal.
    Closed,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A running tool instance. Owned by exactly one state-machine attempt.
pub trait ToolSession: Send {
    /// Wait up to `wait` for output.
    fn read(&mut self, wait: Duration) -> ReadEvent;

    /// Send `line` followed by a newline, as a keystroke sequence.
    fn send_line(&mut self, line: &str) -> Result<(), SessionError>;

    /// Terminate the tool and release the terminal. Idempotent.
    fn close(&mut self);
}

/// Starts tool sessions.
pub trait ToolSpawner: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn ToolSession>, SessionError>;
}

// ---------------------------------------------------------------------------
// PtySpawner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PtySpawner {
    command: Vec<String>,
    env: Vec<(String, String)>,
}

impl PtySpawner {
    pub fn new(cfg: &ToolConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            env: cfg.env.clone(),
        }
    }
}

impl ToolSpawner for PtySpawner {
    fn spawn(&self) -> Result<Box<dyn ToolSession>, SessionError> {
        let (program, args) = self.command.split_first().ok_or(SessionError::EmptyCommand)?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 40,
                cols: 160,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(format!("{e:#}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn {
                program: program.clone(),
                reason: format!("{e:#}"),
            })?;
        // The reader sees EOF only once every slave handle is closed.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Pty(format!("{e:#}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Pty(format!("{e:#}")))?;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("tool-reader".into())
            .spawn(move || pump_output(reader, tx))
            .map_err(|e| SessionError::Spawn {
                program: "tool-reader".into(),
                reason: e.to_string(),
            })?;

        log::info!(
            "[tool] launched {} (pid {})",
            self.command.join(" "),
            child
                .process_id()
                .map_or_else(|| "?".to_string(), |p| p.to_string())
        );

        Ok(Box::new(PtySession {
            child,
            master: Some(pair.master),
            writer: Some(writer),
            rx,
            eof: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// PtySession
// ---------------------------------------------------------------------------

enum Chunk {
    Data(String),
    Eof,
}

pub struct PtySession {
    child: Box<dyn Child + Send + Sync>,
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    rx: Receiver<Chunk>,
    eof: bool,
}

impl ToolSession for PtySession {
    fn read(&mut self, wait: Duration) -> ReadEvent {
        if self.eof {
            return ReadEvent::Closed;
        }
        match self.rx.recv_timeout(wait) {
            Ok(Chunk::Data(text)) => ReadEvent::Data(text),
            Ok(Chunk::Eof) | Err(RecvTimeoutError::Disconnected) => {
                self.eof = true;
                ReadEvent::Closed
            }
            Err(RecvTimeoutError::Timeout) => ReadEvent::Idle,
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        let writer = self.writer.as_mut().ok_or(SessionError::Closed)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        if self.master.is_none() {
            return;
        }
        self.writer = None;
        match self.child.try_wait() {
            Ok(Some(status)) => log::info!("[tool] exited: {status:?}"),
            _ => {
                if let Err(e) = self.child.kill() {
                    log::debug!("[tool] kill: {e}");
                }
                match self.child.wait() {
                    Ok(status) => log::info!("[tool] terminated: {status:?}"),
                    Err(e) => log::warn!("[tool] wait after kill failed: {e}"),
                }
            }
        }
        // Dropping the master hangs up the terminal for any grandchildren.
        self.master = None;
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forward raw output to the session and log it line by line.
fn pump_output(mut reader: Box<dyn Read + Send>, tx: Sender<Chunk>) {
    let mut buf = [0u8; 4096];
    let mut line = String::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                log_lines(&mut line, &text);
                if tx.send(Chunk::Data(text)).is_err() {
                    break;
                }
            }
        }
    }
    if !line.trim().is_empty() {
        log::info!(target: TOOL_LOG_TARGET, "{}", line.trim_end());
    }
    let _ = tx.send(Chunk::Eof);
}

/// Append `text` to the pending `line`, logging every completed line.
fn log_lines(line: &mut String, text: &str) {
    for ch in text.chars() {
        if ch == '\n' || ch == '\r' {
            if !line.trim().is_empty() {
                log::info!(target: TOOL_LOG_TARGET, "{}", line.trim_end());
            }
            line.clear();
        } else {
            line.push(ch);
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedSpawner  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use scripted::{ScriptStep, ScriptedSpawner};

#[cfg(test)]
mod scripted {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{ReadEvent, SessionError, ToolSession, ToolSpawner};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ScriptStep {
        Output(String),
        /// The tool exits.
        Exit,
    }

    impl ScriptStep {
        pub fn out(text: &str) -> Self {
            ScriptStep::Output(text.to_string())
        }
    }

    #[derive(Debug, Default)]
    struct Counters {
        spawns: AtomicU32,
        closes: AtomicU32,
        sent: Mutex<Vec<String>>,
    }

    /// Hands out one scripted session per spawn. `None` in the script list
    /// makes that spawn fail. A session that runs out of script stays silent.
    #[derive(Debug, Default)]
    pub struct ScriptedSpawner {
        scripts: Mutex<VecDeque<Option<Vec<ScriptStep>>>>,
        repeat_last: bool,
        last: Mutex<Option<Option<Vec<ScriptStep>>>>,
        counters: Arc<Counters>,
    }

    impl ScriptedSpawner {
        pub fn new(scripts: Vec<Option<Vec<ScriptStep>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            }
        }

        /// Every spawn gets `script`.
        pub fn repeating(script: Option<Vec<ScriptStep>>) -> Self {
            Self {
                repeat_last: true,
                last: Mutex::new(Some(script)),
                ..Self::default()
            }
        }

        pub fn spawns(&self) -> u32 {
            self.counters.spawns.load(Ordering::SeqCst)
        }

        pub fn closes(&self) -> u32 {
            self.counters.closes.load(Ordering::SeqCst)
        }

        /// Sessions spawned and not yet closed.
        pub fn live(&self) -> u32 {
            self.spawns() - self.closes()
        }

        pub fn sent(&self) -> Vec<String> {
            self.counters.sent.lock().unwrap().clone()
        }

        fn next_script(&self) -> Option<Vec<ScriptStep>> {
            if self.repeat_last {
                return self.last.lock().unwrap().clone().flatten();
            }
            self.scripts.lock().unwrap().pop_front().flatten()
        }
    }

    impl ToolSpawner for ScriptedSpawner {
        fn spawn(&self) -> Result<Box<dyn ToolSession>, SessionError> {
            let script = self.next_script();
            let Some(steps) = script else {
                return Err(SessionError::Spawn {
                    program: "scripted".into(),
                    reason: "scripted spawn failure".into(),
                });
            };
            self.counters.spawns.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSession {
                steps: steps.into(),
                exited: false,
                closed: false,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    struct ScriptedSession {
        steps: VecDeque<ScriptStep>,
        exited: bool,
        closed: bool,
        counters: Arc<Counters>,
    }

    impl ToolSession for ScriptedSession {
        fn read(&mut self, wait: Duration) -> ReadEvent {
            if self.exited {
                return ReadEvent::Closed;
            }
            match self.steps.pop_front() {
                Some(ScriptStep::Output(text)) => ReadEvent::Data(text),
                Some(ScriptStep::Exit) => {
                    self.exited = true;
                    ReadEvent::Closed
                }
                None => {
                    std::thread::sleep(wait.min(Duration::from_millis(5)));
                    ReadEvent::Idle
                }
            }
        }

        fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
            if self.closed {
                return Err(SessionError::Closed);
            }
            self.counters.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.counters.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl Drop for ScriptedSession {
        fn drop(&mut self) {
            self.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn spawner(command: &[&str]) -> PtySpawner {
        PtySpawner::new(&ToolConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..ToolConfig::default()
        })
    }

    /// Collect output until the session closes or `limit` passes.
    fn read_all(session: &mut dyn ToolSession, limit: Duration) -> (String, bool) {
        let deadline = Instant::now() + limit;
        let mut out = String::new();
        while Instant::now() < deadline {
            match session.read(Duration::from_millis(50)) {
                ReadEvent::Data(s) => out.push_str(&s),
                ReadEvent::Idle => {}
                ReadEvent::Closed => return (out, true),
            }
        }
        (out, false)
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            spawner(&[]).spawn().err(),
            Some(SessionError::EmptyCommand)
        ));
    }

    #[test]
    fn pty_session_reads_output_and_eof() {
        let mut session = spawner(&["sh", "-c", "printf 'Waiting for devices'"])
            .spawn()
            .unwrap();
        let (out, closed) = read_all(session.as_mut(), Duration::from_secs(5));
        assert!(out.contains("Waiting for devices"), "{out:?}");
        assert!(closed);
        session.close();
        session.close();
    }

    #[test]
    fn pty_session_sends_keystrokes() {
        let mut session = spawner(&["sh", "-c", "read x; echo got-$x"])
            .spawn()
            .unwrap();
        session.send_line("enter").unwrap();
        let (out, _) = read_all(session.as_mut(), Duration::from_secs(5));
        assert!(out.contains("got-enter"), "{out:?}");
    }

    #[test]
    fn close_kills_a_silent_tool() {
        let mut session = spawner(&["sleep", "30"]).spawn().unwrap();
        assert_eq!(session.read(Duration::from_millis(20)), ReadEvent::Idle);
        let started = Instant::now();
        session.close();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(session.send_line("x").is_err());
    }

    #[test]
    fn output_lines_split_on_cr_and_lf() {
        let mut line = String::from("partial ");
        log_lines(&mut line, "end\r\nnext");
        assert_eq!(line, "next");
    }

    #[test]
    fn scripted_sessions_count_spawns_and_closes() {
        let spawner = ScriptedSpawner::new(vec![
            Some(vec![ScriptStep::out("hi"), ScriptStep::Exit]),
            None,
        ]);
        {
            let mut session = spawner.spawn().unwrap();
            assert_eq!(session.read(Duration::ZERO), ReadEvent::Data("hi".into()));
            assert_eq!(session.read(Duration::ZERO), ReadEvent::Closed);
            session.send_line("").unwrap();
        }
        assert!(spawner.spawn().is_err());
        assert_eq!(spawner.spawns(), 1);
        assert_eq!(spawner.closes(), 1);
        assert_eq!(spawner.sent(), vec![String::new()]);
    }
}
