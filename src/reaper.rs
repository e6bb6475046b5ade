//! Zombie reaping for PID 1.
//!
//! Every exited child of this process is collected with non-blocking
//! `waitpid(-1)` calls whenever SIGCHLD arrives. Each collected exit is
//! reported on a channel so the supervised child's status is never lost to
//! the reaper.

use crate::child::ChildExit;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// One process collected by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    pub exit: ChildExit,
}

/// Start the reaper task. Must be called from within a tokio runtime.
///
/// Children that exited before the reaper started are collected on its first
/// pass. Start it after the supervised child is spawned: a failed spawn waits
/// for its forked process itself and must not race the reaper for it.
///
/// When this process is not PID 1 it asks the kernel (Linux only) to make it
/// a child subreaper, so orphaned descendants are reparented here instead of
/// to the real init.
pub fn start() -> std::io::Result<mpsc::UnboundedReceiver<Reaped>> {
    become_subreaper();

    let mut sigchld = signal(SignalKind::child())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            reap_all(&tx);
            if sigchld.recv().await.is_none() {
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn become_subreaper() {
    if nix::unistd::getpid() == Pid::from_raw(1) {
        return;
    }
    match nix::sys::prctl::set_child_subreaper(true) {
        Ok(()) => tracing::debug!("registered as child subreaper"),
        Err(e) => tracing::warn!(error = %e, "unable to register as child subreaper"),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn become_subreaper() {}

/// Collect every exited child without blocking.
///
/// SIGCHLD deliveries coalesce, so one notification may stand for several
/// exits: keep calling `waitpid` until nothing is left.
fn reap_all(tx: &mpsc::UnboundedSender<Reaped>) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => report(tx, pid, ChildExit::Exited(code)),
            Ok(WaitStatus::Signaled(pid, sig, _)) => report(tx, pid, ChildExit::Signaled(sig)),
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => break,
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed");
                break;
            }
        }
    }
}

fn report(tx: &mpsc::UnboundedSender<Reaped>, pid: Pid, exit: ChildExit) {
    tracing::debug!(pid = pid.as_raw(), ?exit, "reaped process");
    // Keep reaping even if nobody listens any more.
    let _ = tx.send(Reaped { pid, exit });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::PROCESS_LOCK;
    use std::process::Command;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_for(rx: &mut mpsc::UnboundedReceiver<Reaped>, pid: Pid) -> Reaped {
        loop {
            let reaped = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("process not reaped in time")
                .expect("reaper stopped");
            if reaped.pid == pid {
                return reaped;
            }
        }
    }

    #[tokio::test]
    async fn test_reaps_direct_child() {
        let _guard = PROCESS_LOCK.lock().await;
        let mut rx = start().unwrap();

        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let reaped = next_for(&mut rx, pid).await;
        assert_eq!(reaped.exit, ChildExit::Exited(3));
        // Collected: a second wait has nothing left to find.
        assert_eq!(
            waitpid(pid, Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        );
    }

    #[tokio::test]
    async fn test_reaps_several_children_from_coalesced_signals() {
        let _guard = PROCESS_LOCK.lock().await;
        let mut rx = start().unwrap();

        let mut pids = Vec::new();
        for _ in 0..5 {
            let child = Command::new("true").spawn().unwrap();
            pids.push(Pid::from_raw(child.id() as i32));
        }

        let mut seen = Vec::new();
        while seen.len() < pids.len() {
            let reaped = timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if pids.contains(&reaped.pid) {
                assert_eq!(reaped.exit, ChildExit::Exited(0));
                seen.push(reaped.pid);
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[tokio::test]
    async fn test_reaps_orphaned_grandchild() {
        let _guard = PROCESS_LOCK.lock().await;
        let mut rx = start().unwrap();

        // The intermediate shell exits at once; its background child is
        // reparented to us (as subreaper) and reaped when it finishes.
        let mut child = Command::new("sh")
            .args([
                "-c",
                "sh -c 'sleep 0.2; exit 5' 2>/dev/null & echo $! >&2; exit 0",
            ])
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let shell_pid = Pid::from_raw(child.id() as i32);
        let orphan: i32 = read_stderr(&mut child).trim().parse().unwrap();

        next_for(&mut rx, shell_pid).await;
        let reaped = next_for(&mut rx, Pid::from_raw(orphan)).await;
        assert_eq!(reaped.exit, ChildExit::Exited(5));
    }

    /// Read stderr to EOF without calling `wait`: the reaper owns exits.
    fn read_stderr(child: &mut std::process::Child) -> String {
        use std::io::Read;
        let mut out = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            stderr.read_to_string(&mut out).unwrap();
        }
        out
    }
}
