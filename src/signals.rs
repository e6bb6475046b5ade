//! Signal names and OS signal delivery.
//!
//! Signals are never handled inside a real signal handler: tokio's signal
//! driver turns each delivery into a channel event, and the supervisor loop
//! consumes those events like any other.

use nix::sys::signal::Signal;
use std::str::FromStr;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Buffered OS signals not yet consumed by the supervisor loop.
const RELAY_CAPACITY: usize = 100;

/// Every signal the supervisor listens for.
///
/// SIGKILL and SIGSTOP cannot be caught. The synchronous fault signals
/// (SIGILL, SIGFPE, SIGSEGV, SIGBUS, SIGTRAP, SIGSYS, SIGABRT) describe a
/// fault in this process and keep their default action. SIGCHLD is included
/// so the loop sees it, but it is never forwarded. Real-time signals have no
/// `Signal` value and are not relayed.
pub const RELAYED: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGPIPE,
    Signal::SIGALRM,
    Signal::SIGTERM,
    Signal::SIGCHLD,
    Signal::SIGCONT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGURG,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
    Signal::SIGWINCH,
    Signal::SIGIO,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Signal::SIGPWR,
];

/// Resolve a signal by name (`SIGHUP`, `hup`) or number (`1`).
pub fn resolve(name: &str) -> Option<Signal> {
    let name = name.trim();
    if let Ok(number) = name.parse::<i32>() {
        return Signal::try_from(number).ok();
    }

    let upper = name.to_ascii_uppercase();
    if upper.starts_with("SIG") {
        Signal::from_str(&upper).ok()
    } else {
        Signal::from_str(&format!("SIG{upper}")).ok()
    }
}

/// Human-readable name used in log lines.
pub fn name(sig: Signal) -> &'static str {
    sig.as_str()
}

/// Whether this signal belongs to reaping bookkeeping rather than the child.
pub fn is_child_notification(sig: Signal) -> bool {
    sig == Signal::SIGCHLD
}

/// Start listening for `signals` and deliver each one as a channel event.
///
/// One task per signal kind feeds a shared channel. Must be called from
/// within a tokio runtime.
pub fn relay(signals: &[Signal]) -> std::io::Result<mpsc::Receiver<Signal>> {
    let (tx, rx) = mpsc::channel(RELAY_CAPACITY);

    for &sig in signals {
        let mut stream = signal(SignalKind::from_raw(sig as i32))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }

    tracing::debug!(count = signals.len(), "signal relay installed");
    Ok(rx)
}
