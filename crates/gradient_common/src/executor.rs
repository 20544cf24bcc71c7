//! Diagnostic execution with a deadline and bounded output capture.
//!
//! - argv is the invocation split on whitespace; cwd is the bundle root
//! - stdout and stderr share one pipe, so output keeps its interleaving
//! - on deadline expiry the process group gets SIGTERM, then SIGKILL after the
//!   grace period; whatever was printed is returned as a successful result
//! - only the last `max_lines` lines are kept

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::resolver::ResolvedCommand;

/// Hard cap on bytes held while a diagnostic runs; older bytes are dropped
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

const READ_CHUNK: usize = 8192;

/// Stand-in deadline for timeouts too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Output of a diagnostic that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    /// The deadline expired and the process was stopped
    pub timed_out: bool,
}

/// Produced once per resolved command
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub index: usize,
    pub duration: Duration,
    pub outcome: Result<CapturedOutput, ExecError>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Captured text, including the partial output carried by a failure
    pub fn output(&self) -> &str {
        match &self.outcome {
            Ok(captured) => &captured.text,
            Err(ExecError::CommandFailed { output, .. }) => output,
            Err(_) => "",
        }
    }
}

/// Runs resolved commands inside a bundle's working directory
#[derive(Debug, Clone)]
pub struct Executor {
    cwd: PathBuf,
    max_lines: usize,
    kill_grace: Duration,
}

impl Executor {
    pub fn new(cwd: impl Into<PathBuf>, max_lines: usize, kill_grace: Duration) -> Self {
        Self {
            cwd: cwd.into(),
            max_lines,
            kill_grace,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub async fn run(&self, command: &ResolvedCommand) -> ExecutionResult {
        let start = std::time::Instant::now();
        let outcome = self.execute(command).await;
        let duration = start.elapsed();

        match &outcome {
            Ok(captured) => info!(
                index = command.index,
                description = %command.description(),
                duration_ms = duration.as_millis() as u64,
                timed_out = captured.timed_out,
                "Diagnostic finished"
            ),
            Err(e) => warn!(
                index = command.index,
                description = %command.description(),
                duration_ms = duration.as_millis() as u64,
                code = e.code(),
                "Diagnostic failed"
            ),
        }

        ExecutionResult {
            index: command.index,
            duration,
            outcome,
        }
    }

    async fn execute(&self, command: &ResolvedCommand) -> Result<CapturedOutput, ExecError> {
        let description = command.description().to_string();
        let not_resolved = || ExecError::CommandNotResolved {
            command: command.spec.command.clone(),
        };

        let invocation = command.invocation.as_deref().ok_or_else(not_resolved)?;
        let argv: Vec<&str> = invocation.split_whitespace().collect();
        let (program, args) = argv.split_first().ok_or_else(not_resolved)?;

        let spawn_error = |e: std::io::Error| ExecError::CommandFailed {
            description: description.clone(),
            exit: format!("failed to start: {}", e),
            output: String::new(),
        };

        let (reader, writer) = std::io::pipe().map_err(spawn_error)?;
        let writer_err = writer.try_clone().map_err(spawn_error)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err))
            .process_group(0)
            .kill_on_drop(true);

        debug!(index = command.index, %invocation, "Spawning diagnostic");
        let mut child = cmd.spawn().map_err(spawn_error)?;
        let mut group = GroupGuard::new(&child);
        // Release our copies of the write end so EOF arrives when the child exits
        drop(cmd);

        let mut pipe = pipe::Receiver::from_owned_fd(OwnedFd::from(reader)).map_err(spawn_error)?;

        let deadline = deadline_after(command.timeout);
        let mut captured = Vec::new();

        let mut timed_out = !read_until(&mut pipe, &mut captured, deadline).await;
        let mut status = None;
        if !timed_out {
            match timeout_at(deadline, child.wait()).await {
                Ok(Ok(exit)) => status = Some(exit),
                Ok(Err(e)) => {
                    return Err(ExecError::CommandFailed {
                        description,
                        exit: format!("wait failed: {}", e),
                        output: tail_lines(&String::from_utf8_lossy(&captured), self.max_lines),
                    })
                }
                Err(_) => timed_out = true,
            }
        }

        if timed_out {
            debug!(index = command.index, "Deadline expired, stopping diagnostic");
            let exit = self.terminate(&mut child).await;
            debug!(index = command.index, ?exit, "Diagnostic stopped");
            read_until(&mut pipe, &mut captured, Instant::now() + self.kill_grace).await;
        }
        group.disarm();

        let text = tail_lines(&String::from_utf8_lossy(&captured), self.max_lines);

        if timed_out {
            return Ok(CapturedOutput {
                text,
                timed_out: true,
            });
        }

        match status {
            Some(exit) if exit.success() => Ok(CapturedOutput {
                text,
                timed_out: false,
            }),
            Some(exit) => Err(ExecError::CommandFailed {
                description,
                exit: exit.to_string(),
                output: text,
            }),
            None => Err(ExecError::CommandFailed {
                description,
                exit: "no exit status".to_string(),
                output: text,
            }),
        }
    }

    /// SIGTERM the process group, SIGKILL it after the grace period
    async fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        let group = child.id().map(|id| Pid::from_raw(id as i32));

        if let Some(pgid) = group {
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                debug!("SIGTERM to group {} failed: {}", pgid, e);
            }
        }

        match timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(exit)) => {
                // Stragglers in the group still hold the pipe open
                if let Some(pgid) = group {
                    let _ = killpg(pgid, Signal::SIGKILL);
                }
                Some(exit)
            }
            _ => {
                if let Some(pgid) = group {
                    let _ = killpg(pgid, Signal::SIGKILL);
                }
                if let Err(e) = child.kill().await {
                    debug!("Forced kill failed: {}", e);
                }
                child.try_wait().ok().flatten()
            }
        }
    }
}

/// Kills the whole process group if a run is dropped before it finishes.
///
/// `kill_on_drop` only reaches the direct child; the sandbox's descendants
/// share its group and would outlive an aborted task.
struct GroupGuard {
    pgid: Option<Pid>,
}

impl GroupGuard {
    fn new(child: &Child) -> Self {
        Self {
            pgid: child.id().map(|id| Pid::from_raw(id as i32)),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!("Run dropped, killing process group {}", pgid);
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Read into `buf` until EOF (true) or the deadline (false)
async fn read_until(pipe: &mut pipe::Receiver, buf: &mut Vec<u8>, deadline: Instant) -> bool {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match timeout_at(deadline, pipe.read(&mut chunk)).await {
            Ok(Ok(0)) => return true,
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > MAX_CAPTURE_BYTES {
                    let excess = buf.len() - MAX_CAPTURE_BYTES / 2;
                    buf.drain(..excess);
                }
            }
            Ok(Err(e)) => {
                debug!("Output pipe read failed: {}", e);
                return true;
            }
            Err(_) => return false,
        }
    }
}

/// Keep the last `max` lines; a single trailing newline does not count as a line
pub fn tail_lines(text: &str, max: usize) -> String {
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    let lines: Vec<&str> = trimmed.split('\n').collect();
    let start = lines.len().saturating_sub(max);
    lines[start..].join("\n")
}
