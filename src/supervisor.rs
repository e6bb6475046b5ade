//! The supervisor loop: one select over every event source, plus the
//! terminate-then-kill shutdown state machine.
//!
//! Events arrive from four places: OS signals delivered to us, signals raised
//! by sentinels when a watched file changes, sentinel errors when a watched
//! file disappears, and the child's exit. The loop handles them one at a time
//! and returns only when the child has exited, so the supervisor's exit code
//! always reflects the child's outcome.

use crate::child::{ChildControl, ChildExit, ChildProcess, LaunchError};
use crate::config::Config;
use crate::merge::merge;
use crate::sentinel::{self, SentinelError};
use crate::{reaper, signals};
use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Where the shutdown sequence stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Normal operation.
    Running,
    /// SIGTERM sent; SIGKILL follows at `deadline` unless the child exits.
    Terminating { deadline: Instant },
    /// SIGKILL sent; waiting for the exit notification.
    Killed,
}

impl ShutdownState {
    fn deadline(&self) -> Option<Instant> {
        match self {
            ShutdownState::Terminating { deadline } => Some(*deadline),
            _ => None,
        }
    }
}

/// Errors that end supervision without a child exit code.
#[derive(Debug)]
pub enum SuperviseError {
    /// The child could not be launched.
    Launch(LaunchError),
    /// Installing OS signal listeners failed.
    Signals(std::io::Error),
    /// Starting the zombie reaper failed.
    Reaper(std::io::Error),
    /// The exit notification was dropped before the child exited.
    ExitLost,
}

impl SuperviseError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SuperviseError::Launch(e) => e.exit_code(),
            _ => 1,
        }
    }
}

impl std::fmt::Display for SuperviseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuperviseError::Launch(e) => write!(f, "{e}"),
            SuperviseError::Signals(e) => write!(f, "unable to listen for signals: {e}"),
            SuperviseError::Reaper(e) => write!(f, "unable to start zombie reaper: {e}"),
            SuperviseError::ExitLost => {
                write!(f, "lost track of the child before it exited")
            }
        }
    }
}

impl std::error::Error for SuperviseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SuperviseError::Launch(e) => Some(e),
            SuperviseError::Signals(e) | SuperviseError::Reaper(e) => Some(e),
            SuperviseError::ExitLost => None,
        }
    }
}

impl From<LaunchError> for SuperviseError {
    fn from(e: LaunchError) -> Self {
        SuperviseError::Launch(e)
    }
}

/// Every input of the loop.
#[derive(Debug)]
pub struct Events {
    pub os_signals: mpsc::Receiver<Signal>,
    pub sentinel_signals: mpsc::Receiver<Signal>,
    pub sentinel_errors: mpsc::Receiver<SentinelError>,
    pub child_exit: oneshot::Receiver<ChildExit>,
}

/// The single-threaded state machine driving one child.
pub struct EventLoop<'a, C> {
    child: &'a C,
    shutdown: CancellationToken,
    stop_timeout: Duration,
    state: ShutdownState,
}

/// Sleep until `deadline`, or forever when there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<'a, C: ChildControl> EventLoop<'a, C> {
    /// `shutdown` is cancelled when the loop starts terminating the child;
    /// sentinels stop on it.
    pub fn new(child: &'a C, shutdown: CancellationToken, stop_timeout: Duration) -> Self {
        EventLoop {
            child,
            shutdown,
            stop_timeout,
            state: ShutdownState::Running,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// Run until the child exits and return how it exited.
    ///
    /// Closed event channels are simply skipped; only the exit notification
    /// ends the loop.
    pub async fn run(&mut self, mut events: Events) -> Result<ChildExit, SuperviseError> {
        loop {
            tokio::select! {
                Some(err) = events.sentinel_errors.recv() => self.on_sentinel_error(err),
                Some(sig) = events.sentinel_signals.recv() => {
                    tracing::debug!(
                        signal = signals::name(sig),
                        "sending sentinel signal to child process"
                    );
                    self.child.signal(sig);
                }
                Some(sig) = events.os_signals.recv() => self.on_os_signal(sig),
                _ = until(self.state.deadline()) => self.on_deadline(),
                exit = &mut events.child_exit => {
                    return match exit {
                        Ok(exit) => {
                            self.shutdown.cancel();
                            log_exit(exit);
                            Ok(exit)
                        }
                        Err(_) => {
                            self.shutdown.cancel();
                            self.child.kill();
                            Err(SuperviseError::ExitLost)
                        }
                    };
                }
            }
        }
    }

    fn on_sentinel_error(&mut self, err: SentinelError) {
        match self.state {
            ShutdownState::Running => {
                tracing::error!(
                    path = %err.path.display(),
                    error = %err.source,
                    "watched file unavailable, stopping child"
                );
                self.shutdown.cancel();
                self.child.signal(Signal::SIGTERM);
                let deadline = Instant::now() + self.stop_timeout;
                self.state = ShutdownState::Terminating { deadline };
                tracing::info!(
                    stop_timeout_ms = self.stop_timeout.as_millis() as u64,
                    "sent SIGTERM, waiting for child to exit"
                );
            }
            ShutdownState::Terminating { .. } | ShutdownState::Killed => {
                tracing::debug!(
                    path = %err.path.display(),
                    error = %err.source,
                    "watched file unavailable (shutdown already in progress)"
                );
            }
        }
    }

    fn on_os_signal(&self, sig: Signal) {
        if signals::is_child_notification(sig) {
            return;
        }
        tracing::debug!(signal = signals::name(sig), number = sig as i32, "forwarding signal");
        self.child.signal(sig);
    }

    fn on_deadline(&mut self) {
        tracing::info!(
            "timed out waiting for process to exit gracefully on SIGTERM, sending SIGKILL"
        );
        self.child.kill();
        self.state = ShutdownState::Killed;
    }
}

fn log_exit(exit: ChildExit) {
    match exit {
        ChildExit::Exited(code) => tracing::debug!(exit_code = code, "command exited"),
        ChildExit::Signaled(sig) => {
            tracing::info!(signal = %sig, exit_code = exit.code(), "command killed by signal")
        }
    }
}

/// Launch the configured child and supervise it until it exits.
///
/// Returns the exit code the supervisor should terminate with.
pub async fn run(config: Config) -> Result<i32, SuperviseError> {
    // Listen before launching so nothing sent in between is lost.
    let os_signals = signals::relay(signals::RELAYED).map_err(SuperviseError::Signals)?;

    let child = ChildProcess::start(&config.command, &config.args)?;
    let exits = match reaper::start() {
        Ok(exits) => exits,
        Err(e) => {
            child.kill();
            return Err(SuperviseError::Reaper(e));
        }
    };
    let child_exit = child.wait(exits);

    let shutdown = CancellationToken::new();
    let (signal_rxs, error_rxs): (Vec<_>, Vec<_>) = config
        .watches
        .iter()
        .map(|rule| {
            tracing::info!(path = %rule.path.display(), signal = %rule.signal, "watching file");
            let s = sentinel::spawn(rule, config.interval, shutdown.clone());
            (s.signals, s.errors)
        })
        .unzip();

    let events = Events {
        os_signals,
        sentinel_signals: merge(signal_rxs),
        sentinel_errors: merge(error_rxs),
        child_exit,
    };

    let span = tracing::info_span!("supervisor", pid = child.pid().as_raw());
    let exit = EventLoop::new(&child, shutdown, config.stop_timeout)
        .run(events)
        .instrument(span)
        .await?;
    Ok(exit.code())
}
