//! Terminal sessions.
//!
//! A session binds one authenticated connection to one shell. The shell side
//! is reached through the [`ShellSpawner`] and [`ShellHandle`] traits so the
//! protocol handler never touches PTY file descriptors directly; output and
//! exit notifications arrive on an event channel instead of callbacks.

pub mod handler;
pub mod launch;
pub mod pty;

use std::fmt;
use std::path::PathBuf;

use protocol::TerminalSize;
use thiserror::Error;
use tokio::sync::mpsc;

pub use handler::{run_session, DisconnectReason, SessionContext, SessionOutcome};
pub use launch::{LaunchPlan, SpawnOptions};
pub use pty::PtySupervisor;

/// Errors raised while spawning or driving a shell.
#[derive(Error, Debug)]
pub enum PtyError {
    /// PTY allocation or process creation failed.
    #[error("PTY_SPAWN_FAILED: {0}")]
    SpawnFailed(String),

    /// The configured shell path exists but cannot be executed.
    #[error("configured shell is not executable: {0}")]
    ShellNotExecutable(PathBuf),

    /// The configured shell could not be located.
    #[error("configured shell \"{name}\" was not found in PATH: {path}")]
    ShellNotFound { name: String, path: String },

    /// Writing input to the shell failed.
    #[error("failed to write to shell: {0}")]
    WriteFailed(String),

    /// Applying a new geometry failed.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PtyError {
    /// Stable code for logs and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            PtyError::SpawnFailed(_) => "PTY_SPAWN_FAILED",
            PtyError::ShellNotExecutable(_) | PtyError::ShellNotFound { .. } => {
                "SHELL_UNAVAILABLE"
            }
            PtyError::WriteFailed(_) => "PTY_WRITE_FAILED",
            PtyError::ResizeFailed(_) => "PTY_RESIZE_FAILED",
            PtyError::Io(_) => "PTY_IO",
        }
    }
}

/// How the shell process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn new(exit_code: Option<i32>, signal: Option<String>) -> Self {
        Self { exit_code, signal }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "Process exited with code {}", code)?,
            None => write!(f, "Process exited with code unknown")?,
        }
        if let Some(signal) = &self.signal {
            write!(f, " (signal: {})", signal)?;
        }
        Ok(())
    }
}

/// Events emitted by a running shell, in order. `Exit` is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw output bytes. May end in the middle of a UTF-8 sequence.
    Data(Vec<u8>),
    /// The process ended. No restart follows.
    Exit(ExitInfo),
}

/// Control surface of one running shell.
pub trait ShellHandle: Send {
    /// Forwards input verbatim.
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError>;

    /// Applies a new geometry. Returns `Ok(false)` when the request was
    /// ignored: below the floor, or the backend has no geometry.
    fn resize(&mut self, size: TerminalSize) -> Result<bool, PtyError>;

    /// Terminates the process. Best-effort and idempotent; failures are
    /// logged, never returned.
    fn kill(&mut self);

    /// Geometry currently applied.
    fn size(&self) -> TerminalSize;

    /// Process id, when known.
    fn pid(&self) -> Option<u32>;
}

/// A freshly spawned shell with its event stream.
pub struct SpawnedShell {
    pub handle: Box<dyn ShellHandle>,
    pub events: mpsc::Receiver<PtyEvent>,
}

impl fmt::Debug for SpawnedShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedShell")
            .field("pid", &self.handle.pid())
            .field("size", &self.handle.size())
            .finish()
    }
}

/// Creates shells for admitted sessions.
pub trait ShellSpawner: Send + Sync {
    fn spawn(&self, size: TerminalSize) -> Result<SpawnedShell, PtyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_message_without_signal() {
        let info = ExitInfo::new(Some(0), None);
        assert_eq!(info.to_string(), "Process exited with code 0");
    }

    #[test]
    fn test_exit_message_with_signal() {
        let info = ExitInfo::new(Some(1), Some("SIGHUP".to_string()));
        assert_eq!(info.to_string(), "Process exited with code 1 (signal: SIGHUP)");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            PtyError::SpawnFailed("x".into()).code(),
            "PTY_SPAWN_FAILED"
        );
        assert_eq!(
            PtyError::ShellNotExecutable(PathBuf::from("/etc/passwd")).code(),
            "SHELL_UNAVAILABLE"
        );
    }
}
