//! Hypervisor child process supervision.
//!
//! [`Process::spawn`] starts the hypervisor with all three standard streams
//! piped and hands back a [`Process`] plus per-line output on an event
//! channel. Two reader tasks forward stdout and stderr lines; a waiter task
//! reaps the child and sends [`VmEvent::Exited`] exactly once. None of the
//! tasks are joined: they end on their own when the streams close.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::command::LaunchCommand;
use crate::{Error, Result};

/// Output and lifecycle notifications from a running hypervisor.
///
/// Lines of one stream arrive in order; the two streams and the exit event
/// may interleave arbitrarily.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VmEvent {
    /// One line of standard output, without the newline.
    Stdout(String),
    /// One line of standard error, without the newline.
    Stderr(String),
    /// The process terminated. `code` is `None` when it died from a signal.
    Exited {
        /// Exit code.
        code: Option<i32>,
    },
}

/// Exit state published by the waiter task: `None` while running.
type ExitSlot = Option<Option<i32>>;

/// A supervised hypervisor process.
#[derive(Debug)]
pub struct Process {
    /// OS process ID.
    pid: u32,
    /// Write end of the child's stdin.
    stdin: Option<ChildStdin>,
    /// Exit state, set once by the waiter task.
    exit: watch::Receiver<ExitSlot>,
    /// Asks the waiter task to kill the child.
    kill_tx: mpsc::UnboundedSender<()>,
}

impl Process {
    /// Spawns `cmd`, forwarding output and the exit status to `events`.
    pub fn spawn(cmd: &LaunchCommand, events: mpsc::UnboundedSender<VmEvent>) -> Result<Self> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "child exited before start")
        })?;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_lines(out, events.clone(), VmEvent::Stdout));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(err, events.clone(), VmEvent::Stderr));
        }
        let stdin = child.stdin.take();

        let (exit_tx, exit) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let status = tokio::select! {
                s = child.wait() => s,
                Some(()) = kill_rx.recv() => {
                    if let Err(e) = child.start_kill() {
                        debug!(pid, error = %e, "kill failed");
                    }
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code());
            info!(pid, ?code, "hypervisor exited");
            exit_tx.send_replace(Some(code));
            let _ = events.send(VmEvent::Exited { code });
        });

        info!(pid, program = %cmd.program.display(), "hypervisor started");
        Ok(Self {
            pid,
            stdin,
            exit,
            kill_tx,
        })
    }

    /// OS process ID.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns `true` until the process has been reaped.
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Exit code once reaped; `Some(None)` after death by signal.
    pub fn exit_code(&self) -> Option<Option<i32>> {
        *self.exit.borrow()
    }

    /// Waits for the process to exit and returns its exit code.
    pub async fn wait(&self) -> Option<i32> {
        let mut rx = self.exit.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).flatten(),
            Err(_) => None,
        }
    }

    /// Requests cooperative termination (`SIGTERM`).
    pub fn terminate(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        debug!(pid = self.pid, "sending SIGTERM");
        signal_term(self.pid)
    }

    /// Kills the process immediately.
    pub fn kill(&self) -> Result<()> {
        if self.is_alive() {
            debug!(pid = self.pid, "killing");
            let _ = self.kill_tx.send(());
        }
        Ok(())
    }

    /// Writes raw bytes to the child's stdin.
    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin is closed",
            ))
        })?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Closes the child's stdin.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }
}

/// Forwards each line of `stream` until it closes or errors.
///
/// Guest consoles emit arbitrary bytes, so lines are decoded lossily.
/// Keeps draining after the receiver is gone so the child never blocks
/// on a full pipe.
async fn forward_lines<R>(
    stream: R,
    events: mpsc::UnboundedSender<VmEvent>,
    wrap: fn(String) -> VmEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = trim_eol(&buf);
                let _ = events.send(wrap(String::from_utf8_lossy(line).into_owned()));
            }
        }
    }
}

/// Strips one trailing `\n` or `\r\n`.
fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(unix)]
fn signal_term(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(not(unix))]
fn signal_term(_pid: u32) -> Result<()> {
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "cooperative termination requires a Unix host",
    )))
}
