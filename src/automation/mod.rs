//! Supervision of the external jailbreak tool: PTY sessions, output
//! classification, the per-attempt state machine and the retry loop.

pub mod machine;
pub mod orchestrator;
pub mod session;
pub mod signal;
pub mod state;

pub use machine::{AttemptOutcome, RetryCause, SessionEvent, StateMachine};
pub use orchestrator::{Orchestrator, RetryPolicy, RunOutcome, RunSummary};
pub use session::{PtySpawner, SessionError, ToolSession, ToolSpawner, TOOL_LOG_TARGET};
pub use signal::{PatternTable, Signal, SignalScanner};
pub use state::{SessionPhase, SharedPhase};

#[cfg(test)]
pub use session::{ScriptStep, ScriptedSpawner};
