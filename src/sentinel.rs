//! File sentinels: poll one file's metadata and turn changes into signals.
//!
//! Each sentinel runs as its own task with its own timer. It compares the
//! file's size and modification time against the last snapshot it saw and
//! reports on two channels: the target signal when the file changed, or a
//! [`SentinelError`] when the file could not be stat'ed.

use crate::config::WatchRule;
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Pending events buffered per output channel.
const CHANNEL_CAPACITY: usize = 1;

/// The metadata a sentinel compares between polls. File contents are never read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Snapshot {
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        Snapshot {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// A watched file could not be stat'ed.
#[derive(Debug)]
pub struct SentinelError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for SentinelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "watched file {} is unavailable: {}",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for SentinelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Receiving ends of one running sentinel.
#[derive(Debug)]
pub struct Sentinel {
    pub signals: mpsc::Receiver<Signal>,
    pub errors: mpsc::Receiver<SentinelError>,
}

/// Change detector for a single path.
///
/// A failed stat leaves the snapshot untouched, so a file that disappears and
/// comes back with the same size and mtime is not reported as changed.
#[derive(Debug)]
struct Watch {
    path: PathBuf,
    signal: Signal,
    last: Option<Snapshot>,
}

impl Watch {
    /// Record a fresh observation. Returns the signal to raise if it differs
    /// from the last snapshot. The first observation after an initial failure
    /// counts as a change.
    fn observe(&mut self, current: Snapshot) -> Option<Signal> {
        if self.last == Some(current) {
            return None;
        }
        self.last = Some(current);
        Some(self.signal)
    }

    fn error(&self, source: std::io::Error) -> SentinelError {
        SentinelError {
            path: self.path.clone(),
            source,
        }
    }
}

fn stat_now(path: &Path) -> std::io::Result<Snapshot> {
    std::fs::metadata(path).map(|m| Snapshot::of(&m))
}

async fn stat(path: &Path) -> std::io::Result<Snapshot> {
    tokio::fs::metadata(path).await.map(|m| Snapshot::of(&m))
}

/// Send `event`, giving up if shutdown is observed while the channel is full.
/// Returns `false` when the sentinel should stop.
async fn emit<T>(tx: &mpsc::Sender<T>, event: T, done: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = done.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Start a sentinel for `rule`, polling every `interval` until `done` fires.
///
/// The file is stat'ed once before this returns; if that fails, the error is
/// already queued on the returned error channel. The sentinel keeps polling
/// either way.
///
/// `interval` must be non-zero.
pub fn spawn(rule: &WatchRule, interval: Duration, done: CancellationToken) -> Sentinel {
    let (signals_tx, signals_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (errors_tx, errors_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let mut watch = Watch {
        path: rule.path.clone(),
        signal: rule.signal,
        last: None,
    };

    match stat_now(&watch.path) {
        Ok(snapshot) => watch.last = Some(snapshot),
        Err(e) => {
            tracing::warn!(
                path = %watch.path.display(),
                error = %e,
                "watched file unavailable at startup"
            );
            // Fresh channel with free capacity: cannot fail.
            let _ = errors_tx.try_send(watch.error(e));
        }
    }

    let span = tracing::info_span!("sentinel", path = %watch.path.display());
    tokio::spawn(
        poll_loop(watch, interval, signals_tx, errors_tx, done).instrument(span),
    );

    Sentinel {
        signals: signals_rx,
        errors: errors_rx,
    }
}

async fn poll_loop(
    mut watch: Watch,
    period: Duration,
    signals_tx: mpsc::Sender<Signal>,
    errors_tx: mpsc::Sender<SentinelError>,
    done: CancellationToken,
) {
    // First poll one full interval after start.
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        signal = %watch.signal,
        interval_ms = period.as_millis() as u64,
        "sentinel started"
    );

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let keep_going = match stat(&watch.path).await {
            Err(e) => {
                tracing::debug!(error = %e, "stat failed");
                emit(&errors_tx, watch.error(e), &done).await
            }
            Ok(current) => match watch.observe(current) {
                Some(sig) => {
                    tracing::debug!(signal = %sig, "change detected");
                    emit(&signals_tx, sig, &done).await
                }
                None => true,
            },
        };
        if !keep_going {
            break;
        }
    }

    tracing::debug!("sentinel shutting down");
}
