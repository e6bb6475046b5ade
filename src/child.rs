//! The supervised child: launch, signal, wait, force-kill.

use crate::reaper::Reaped;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use tokio::sync::{mpsc, oneshot};

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// The program returned this status code.
    Exited(i32),
    /// The program was killed by a signal it did not handle.
    Signaled(Signal),
}

impl ChildExit {
    /// Exit code the supervisor passes on: the child's own code, or
    /// `128 + signal` when it died from a signal.
    pub fn code(self) -> i32 {
        match self {
            ChildExit::Exited(code) => code,
            ChildExit::Signaled(sig) => 128 + sig as i32,
        }
    }
}

/// The child program could not be started.
#[derive(Debug)]
pub struct LaunchError {
    pub command: String,
    pub source: std::io::Error,
}

impl LaunchError {
    /// Shell convention: 127 for "not found", 126 for "not executable".
    pub fn exit_code(&self) -> i32 {
        match self.source.kind() {
            std::io::ErrorKind::NotFound => 127,
            std::io::ErrorKind::PermissionDenied => 126,
            _ => 1,
        }
    }
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unable to start command '{}': {}", self.command, self.source)
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Operations the supervisor loop performs on its child.
///
/// Both are fire-and-forget: delivery failures are logged, never returned.
pub trait ChildControl {
    /// Deliver `sig` to the child.
    fn signal(&self, sig: Signal);

    /// Unconditionally kill the child. A no-op once it has exited.
    fn kill(&self);
}

/// A launched child process, in its own process group.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    // Never waited on through std: the reaper collects the exit status.
    _handle: std::process::Child,
}

impl ChildProcess {
    /// Launch `command` with inherited stdio in a new process group.
    pub fn start(command: &str, args: &[String]) -> Result<Self, LaunchError> {
        let handle = Command::new(command)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0) // Group signals sent to the child never reach us
            .spawn()
            .map_err(|e| LaunchError {
                command: command.to_string(),
                source: e,
            })?;

        let pid = Pid::from_raw(handle.id() as i32);
        tracing::info!(pid = pid.as_raw(), command, ?args, "child process started");
        Ok(ChildProcess {
            pid,
            _handle: handle,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Watch the reaper's exit reports for this child on a dedicated task.
    ///
    /// The returned receiver resolves once with the child's exit. If the
    /// reaper stops first, the sender is dropped and the receiver errors.
    pub fn wait(&self, mut exits: mpsc::UnboundedReceiver<Reaped>) -> oneshot::Receiver<ChildExit> {
        let pid = self.pid;
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            while let Some(reaped) = exits.recv().await {
                if reaped.pid == pid {
                    let _ = tx.send(reaped.exit);
                    return;
                }
                tracing::debug!(
                    pid = reaped.pid.as_raw(),
                    exit = ?reaped.exit,
                    "reaped orphaned process"
                );
            }
            tracing::warn!(pid = pid.as_raw(), "reaper stopped before the child exited");
        });

        rx
    }
}

impl ChildControl for ChildProcess {
    fn signal(&self, sig: Signal) {
        match kill(self.pid, sig) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                tracing::warn!(signal = %sig, "unable to send signal: child no longer exists");
            }
            Err(e) => {
                tracing::warn!(signal = %sig, error = %e, "unable to send signal");
            }
        }
    }

    fn kill(&self) {
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!(error = %e, "SIGKILL failed"),
        }
    }
}
