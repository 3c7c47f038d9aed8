//! Interface to the wrapped agent process.
//!
//! Tether does not parse the agent's raw stdout itself. The process wrapper
//! classifies output lines and hands the bridge already-typed events; the
//! only capabilities the core needs back are stdin injection and lifecycle
//! control, captured by [`AgentHandle`].

mod events;
mod process;

pub use events::{ActionKind, AgentEvent, ClassifiedPrompt, RiskLevel};
pub use process::{ChildAgent, LineClassifier};

use std::time::Duration;

use async_trait::async_trait;

/// Handle to the wrapped agent subprocess.
///
/// Implemented by the pty wrapper that owns the child process. The deck only
/// ever injects answer text, asks for an interrupt, or stops the process.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Write text to the agent's stdin. Returns false if the write failed
    /// (e.g. the process already exited).
    async fn inject(&self, text: &str) -> bool;

    /// Whether the subprocess is still alive.
    fn is_running(&self) -> bool;

    /// Deliver an interrupt (SIGINT) for a graceful halt.
    async fn interrupt(&self) -> anyhow::Result<()>;

    /// Stop the subprocess, waiting up to `timeout` before killing it.
    /// Returns the exit code.
    async fn stop(&self, timeout: Duration) -> anyhow::Result<i32>;
}

