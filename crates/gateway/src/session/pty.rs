//! PTY supervisor.
//!
//! Spawns the shell on a pseudo-terminal and streams its output onto an
//! event channel. When PTY allocation fails the spawn is fatal unless the
//! operator opted into the piped fallback, in which case the shell runs as
//! a plain child with stdin/stdout/stderr pipes and resize does nothing.

use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child as StdChild, ChildStdin, Command, Stdio};
use std::thread;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use protocol::TerminalSize;
use tokio::sync::mpsc;

use super::launch::{is_executable, LaunchPlan, SpawnOptions};
use super::{ExitInfo, PtyError, PtyEvent, ShellHandle, ShellSpawner, SpawnedShell};

/// Buffer size for reading from the shell.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the per-shell event channel.
const EVENT_CAPACITY: usize = 256;

/// Spawns configured shells, one per admitted session.
#[derive(Debug, Clone)]
pub struct PtySupervisor {
    options: SpawnOptions,
}

impl PtySupervisor {
    pub fn new(options: SpawnOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SpawnOptions {
        &self.options
    }
}

impl ShellSpawner for PtySupervisor {
    fn spawn(&self, size: TerminalSize) -> Result<SpawnedShell, PtyError> {
        let plan = LaunchPlan::prepare(&self.options, size)?;

        match spawn_pty(&plan) {
            Ok(shell) => Ok(shell),
            Err(e) if self.options.allow_non_pty_fallback => {
                tracing::warn!(
                    error = %e,
                    plan = %plan.describe(),
                    "PTY spawn failed; falling back to piped child process"
                );
                spawn_piped(&plan)
            }
            Err(e) => Err(e),
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawns the shell on a fresh PTY pair.
fn spawn_pty(plan: &LaunchPlan) -> Result<SpawnedShell, PtyError> {
    let fail = |e: &dyn std::fmt::Display| {
        PtyError::SpawnFailed(format!("{} ({})", e, plan.describe()))
    };

    let pair = native_pty_system()
        .openpty(pty_size(plan.size))
        .map_err(|e| fail(&e))?;

    let mut cmd = CommandBuilder::new(&plan.shell);
    cmd.cwd(&plan.cwd);
    cmd.env_clear();
    for (key, value) in &plan.env {
        cmd.env(key, value);
    }

    let child = pair.slave.spawn_command(cmd).map_err(|e| fail(&e))?;
    // Only the child keeps the slave open, so the reader sees EOF on exit.
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().map_err(|e| fail(&e))?;
    let writer = pair.master.take_writer().map_err(|e| fail(&e))?;
    let killer = child.clone_killer();
    let pid = child.process_id();

    let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);
    thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || pump_pty(reader, child, events_tx))
        .map_err(|e| fail(&e))?;

    tracing::info!(
        pid = ?pid,
        shell = %plan.shell.display(),
        cols = plan.size.cols,
        rows = plan.size.rows,
        "Spawned shell on PTY"
    );

    Ok(SpawnedShell {
        handle: Box::new(PtyShell {
            master: pair.master,
            writer,
            killer,
            size: plan.size,
            pid,
            killed: false,
        }),
        events,
    })
}

/// Reads PTY output until EOF, then reaps the child and reports its exit.
fn pump_pty(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    events: mpsc::Sender<PtyEvent>,
) {
    forward_output(&mut reader, &events);

    let info = match child.wait() {
        Ok(status) => exit_info(&status),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to reap shell process");
            ExitInfo::new(None, None)
        }
    };

    tracing::info!(exit = %info, "Shell exited");
    let _ = events.blocking_send(PtyEvent::Exit(info));
}

/// portable-pty only exposes the terminating signal through `Display`
/// ("Terminated by Hangup"); the code it reports alongside is synthetic.
fn exit_info(status: &ExitStatus) -> ExitInfo {
    match status.to_string().strip_prefix("Terminated by ") {
        Some(signal) => ExitInfo::new(None, Some(signal.to_string())),
        None => ExitInfo::new(Some(status.exit_code() as i32), None),
    }
}

/// Copies chunks from `reader` onto `events` until EOF, a read error, or the
/// receiver going away.
fn forward_output(reader: &mut dyn Read, events: &mpsc::Sender<PtyEvent>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if events.blocking_send(PtyEvent::Data(buffer[..n].to_vec())).is_err() {
                    tracing::trace!("Shell output receiver dropped");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the slave side closes.
                tracing::debug!(error = %e, "Shell output stream ended");
                break;
            }
        }
    }
}

/// A shell running on a PTY.
struct PtyShell {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    size: TerminalSize,
    pid: Option<u32>,
    killed: bool,
}

impl ShellHandle for PtyShell {
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer
            .write_all(data)
            .and_then(|_| self.writer.flush())
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    fn resize(&mut self, size: TerminalSize) -> Result<bool, PtyError> {
        if !size.meets_floor() {
            tracing::debug!(cols = size.cols, rows = size.rows, "Ignoring resize below floor");
            return Ok(false);
        }

        self.master
            .resize(pty_size(size))
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        self.size = size;

        tracing::debug!(cols = size.cols, rows = size.rows, "Resized PTY");
        Ok(true)
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        if let Err(e) = self.killer.kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "Kill failed; shell likely already gone");
        }
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Spawns the shell as `<shell> -il` on plain pipes.
fn spawn_piped(plan: &LaunchPlan) -> Result<SpawnedShell, PtyError> {
    let shell = if is_executable(&plan.shell) {
        plan.shell.clone()
    } else if is_executable(std::path::Path::new("/bin/bash")) {
        PathBuf::from("/bin/bash")
    } else {
        PathBuf::from("/bin/sh")
    };

    let mut child = Command::new(&shell)
        .arg("-il")
        .current_dir(&plan.cwd)
        .env_clear()
        .envs(&plan.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PtyError::SpawnFailed(format!("{} ({})", e, plan.describe())))?;

    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);

    let mut readers = Vec::new();
    for stream in [
        stdout.map(|s| Box::new(s) as Box<dyn Read + Send>),
        stderr.map(|s| Box::new(s) as Box<dyn Read + Send>),
    ]
    .into_iter()
    .flatten()
    {
        let tx = events_tx.clone();
        let handle = thread::Builder::new()
            .name("pipe-reader".to_string())
            .spawn(move || {
                let mut stream = stream;
                forward_output(&mut stream, &tx);
            })?;
        readers.push(handle);
    }

    thread::Builder::new()
        .name("pipe-reaper".to_string())
        .spawn(move || reap_piped(child, readers, events_tx))?;

    tracing::warn!(
        pid,
        shell = %shell.display(),
        "Spawned shell without a PTY; resize is disabled for this session"
    );

    Ok(SpawnedShell {
        handle: Box::new(PipedShell {
            stdin,
            pid,
            size: plan.size,
            killed: false,
        }),
        events,
    })
}

fn reap_piped(
    mut child: StdChild,
    readers: Vec<thread::JoinHandle<()>>,
    events: mpsc::Sender<PtyEvent>,
) {
    for reader in readers {
        let _ = reader.join();
    }

    let info = match child.wait() {
        Ok(status) => ExitInfo::new(
            status.code(),
            status
                .signal()
                .and_then(|sig| Signal::try_from(sig).ok())
                .map(|sig| sig.as_str().to_string()),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to reap shell process");
            ExitInfo::new(None, None)
        }
    };

    tracing::info!(exit = %info, "Shell exited");
    let _ = events.blocking_send(PtyEvent::Exit(info));
}

/// A shell running on pipes, without terminal semantics.
struct PipedShell {
    stdin: Option<ChildStdin>,
    pid: u32,
    size: TerminalSize,
    killed: bool,
}

impl ShellHandle for PipedShell {
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin
                .write_all(data)
                .and_then(|_| stdin.flush())
                .map_err(|e| PtyError::WriteFailed(e.to_string())),
            None => Ok(()),
        }
    }

    fn resize(&mut self, size: TerminalSize) -> Result<bool, PtyError> {
        tracing::trace!(cols = size.cols, rows = size.rows, "Resize ignored without a PTY");
        Ok(false)
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        self.stdin = None;

        let Ok(raw) = i32::try_from(self.pid) else {
            return;
        };
        if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
            tracing::debug!(pid = self.pid, error = %e, "Kill failed; shell likely already gone");
        }
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}
