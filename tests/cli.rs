//! End-to-end tests: run the compiled supervisor against real child processes.

use filetime::FileTime;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

fn supervisor() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_init-sentinel"));
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    cmd
}

fn wait_with_timeout(child: &mut Child, limit: Duration) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if start.elapsed() > limit {
            let _ = child.kill();
            panic!("supervisor did not exit within {limit:?}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_file(path: &Path, limit: Duration) {
    let start = Instant::now();
    while !path.exists() {
        assert!(start.elapsed() < limit, "{} never appeared", path.display());
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_exit_code_passes_through() {
    let status = supervisor()
        .args(["/bin/sh", "-c", "exit 7"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(7));
}

#[test]
fn test_successful_child_exits_zero() {
    let status = supervisor().arg("true").status().unwrap();
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_version_exits_zero_without_child() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let output = supervisor()
        .stdout(Stdio::piped())
        .args(["--version", "touch"])
        .arg(&marker)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
    assert!(!marker.exists());
}

#[test]
fn test_missing_command_is_config_error() {
    let status = supervisor().status().unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
fn test_bad_watch_rule_fails_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    for rule in ["/tmp/f", "/tmp/f:SIGNOTREAL"] {
        let status = supervisor()
            .args(["--watch", rule, "touch"])
            .arg(&marker)
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(2), "rule {rule:?}");
        assert!(!marker.exists(), "child launched despite bad rule {rule:?}");
    }
}

#[test]
fn test_unknown_program_exits_127() {
    let status = supervisor().arg("nonexistent-binary-xyz").status().unwrap();
    assert_eq!(status.code(), Some(127));
}

#[test]
fn test_file_change_sends_signal_once_and_term_is_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("f");
    let hups = dir.path().join("hups");
    let ready = dir.path().join("ready");
    std::fs::write(&watched, "config").unwrap();

    let rule = format!("{}:SIGHUP", watched.display());
    let mut child = supervisor()
        .args(["--watch", &rule, "--interval", "50ms", "--"])
        .args([
            "/bin/sh",
            "-c",
            r#"trap 'echo hup >> "$1"' HUP; touch "$2"; while :; do sleep 0.05; done"#,
            "sh",
        ])
        .arg(&hups)
        .arg(&ready)
        .spawn()
        .unwrap();

    wait_for_file(&ready, Duration::from_secs(10));
    std::thread::sleep(Duration::from_millis(200));
    filetime::set_file_mtime(&watched, FileTime::from_unix_time(1_000_000, 0)).unwrap();

    wait_for_file(&hups, Duration::from_secs(5));
    std::thread::sleep(Duration::from_millis(300));
    let received = std::fs::read_to_string(&hups).unwrap();
    assert_eq!(received.lines().count(), 1, "expected exactly one SIGHUP");

    // SIGTERM to the supervisor is relayed to the child, which dies from it.
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(143));
}

#[test]
fn test_missing_watched_file_kills_child_after_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let rule = format!("{}:SIGHUP", dir.path().join("missing").display());

    let start = Instant::now();
    let mut child = supervisor()
        .args([
            "--watch",
            &rule,
            "--interval",
            "1h",
            "--stop-timeout",
            "300ms",
            "--",
            "/bin/sh",
            "-c",
            "trap '' TERM; while :; do sleep 0.05; done",
        ])
        .spawn()
        .unwrap();

    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(137));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[test]
fn test_config_file_watch_rules() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("sentinel.toml");
    std::fs::write(
        &config,
        format!(
            "stop_timeout = \"5s\"\n\n[[watch]]\npath = \"{}\"\nsignal = \"SIGHUP\"\n",
            dir.path().join("missing").display()
        ),
    )
    .unwrap();

    // The missing watched file makes the supervisor stop the child politely.
    let mut child = supervisor()
        .arg("--config")
        .arg(&config)
        .args(["--", "sleep", "30"])
        .spawn()
        .unwrap();
    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(143));
}
