//! Lifecycle Tests
//!
//! These tests spawn the actual shutdown-daemon binary and verify the
//! start/status/stop protocol end-to-end, including the double fork and
//! the signal-driven marker removal.
//!
//! The GPIO pin is simulated with a level file and the shutdown command is
//! replaced, so nothing here touches hardware or halts the machine.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wait_timeout::ChildExt;

/// Get the path to the built binary
fn binary_path() -> &'static str {
    env!("CARGO_BIN_EXE_shutdown-daemon")
}

/// Scratch directory with a marker path and a simulated pin
struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new(level: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("level"), level).unwrap();
        Self { dir }
    }

    fn pid_file(&self) -> PathBuf {
        self.dir.path().join("daemon.pid")
    }

    fn halted_file(&self) -> PathBuf {
        self.dir.path().join("halted")
    }

    /// Run a verb with timeout; the launcher must return promptly
    fn run(&self, args: &[&str]) -> Output {
        let mut child = Command::new(binary_path())
            .args(args)
            .env("SHUTDOWN_DAEMON_PID_FILE", self.pid_file())
            .env("SHUTDOWN_DAEMON_LEVEL_FILE", self.dir.path().join("level"))
            .env(
                "SHUTDOWN_DAEMON_SHUTDOWN_COMMAND",
                format!("touch {}", self.halted_file().display()),
            )
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("Failed to spawn shutdown-daemon");

        match child.wait_timeout(Duration::from_secs(10)).unwrap() {
            Some(_) => child.wait_with_output().unwrap(),
            None => {
                let _ = child.kill();
                panic!("shutdown-daemon {:?} did not return", args);
            }
        }
    }

    fn recorded_pid(&self) -> Option<i32> {
        fs::read_to_string(self.pid_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

/// Kills a leaked daemon if an assertion fails mid-test
struct Reaper(Option<i32>);

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn process_exists(pid: i32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Whether `pid` has a handler for `signal` (SigCgt in /proc/<pid>/status)
fn catches_signal(pid: i32, signal: Signal) -> bool {
    let Ok(status) = fs::read_to_string(format!("/proc/{}/status", pid)) else {
        return false;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("SigCgt:"))
        .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
        .map(|mask| mask & (1 << (signal as i32 - 1)) != 0)
        .unwrap_or(false)
}

/// start → marker holds daemon pid → status reports it → stop removes marker
#[test]
fn test_start_status_stop_roundtrip() {
    let sandbox = Sandbox::new("1\n");

    let start = sandbox.run(&["start"]);
    assert_eq!(start.status.code(), Some(0));
    assert!(stdout(&start).contains("Daemon starting..."));

    assert!(
        wait_until(Duration::from_secs(10), || sandbox.recorded_pid().is_some()),
        "marker never appeared"
    );
    let pid = sandbox.recorded_pid().unwrap();
    let mut reaper = Reaper(Some(pid));
    assert!(process_exists(pid));
    assert_eq!(
        fs::read_to_string(sandbox.pid_file()).unwrap(),
        format!("{}\n", pid)
    );

    let status = sandbox.run(&["status"]);
    assert_eq!(status.status.code(), Some(0));
    assert_eq!(
        stdout(&status),
        format!("Daemon is running with pid: {}.\n", pid)
    );

    assert!(wait_until(Duration::from_secs(10), || catches_signal(
        pid,
        Signal::SIGINT
    )));
    let stop = sandbox.run(&["stop"]);
    assert_eq!(stop.status.code(), Some(0));
    assert_eq!(stdout(&stop), "Stopping daemon... stopped!\n");

    assert!(
        wait_until(Duration::from_secs(10), || !sandbox.pid_file().exists()),
        "marker not removed after stop"
    );
    reaper.0 = None;

    let status = sandbox.run(&["status"]);
    assert_eq!(stdout(&status), "Daemon is stopped.\n");
    assert!(!sandbox.halted_file().exists());
}

/// A second start with the marker present is a no-op
#[test]
fn test_start_twice_keeps_first_daemon() {
    let sandbox = Sandbox::new("1\n");

    sandbox.run(&["start"]);
    assert!(wait_until(Duration::from_secs(10), || sandbox
        .recorded_pid()
        .is_some()));
    let pid = sandbox.recorded_pid().unwrap();
    let _reaper = Reaper(Some(pid));

    let again = sandbox.run(&["start"]);
    assert_eq!(again.status.code(), Some(0));
    assert_eq!(stdout(&again), "Daemon is already running.\n");
    assert_eq!(sandbox.recorded_pid(), Some(pid));

    assert!(wait_until(Duration::from_secs(10), || catches_signal(
        pid,
        Signal::SIGINT
    )));
    sandbox.run(&["stop"]);
    assert!(wait_until(Duration::from_secs(10), || !sandbox
        .pid_file()
        .exists()));
}

/// Pressed button triggers the shutdown action within one poll interval
#[test]
fn test_asserted_pin_invokes_shutdown() {
    let sandbox = Sandbox::new("0\n");

    sandbox.run(&["start"]);
    assert!(wait_until(Duration::from_secs(10), || sandbox
        .recorded_pid()
        .is_some()));
    let pid = sandbox.recorded_pid().unwrap();
    let _reaper = Reaper(Some(pid));

    assert!(
        wait_until(Duration::from_secs(5), || sandbox.halted_file().exists()),
        "shutdown action never ran"
    );
    assert!(catches_signal(pid, Signal::SIGINT));

    sandbox.run(&["stop"]);
    assert!(wait_until(Duration::from_secs(10), || !sandbox
        .pid_file()
        .exists()));
}

#[test]
fn test_stop_when_not_running() {
    let sandbox = Sandbox::new("1\n");

    for _ in 0..2 {
        let stop = sandbox.run(&["stop"]);
        assert_eq!(stop.status.code(), Some(0));
        assert_eq!(stdout(&stop), "Daemon is not running.\n");
        assert!(!sandbox.pid_file().exists());
    }
}

#[test]
fn test_status_when_stopped() {
    let sandbox = Sandbox::new("1\n");

    let status = sandbox.run(&["status"]);
    assert_eq!(status.status.code(), Some(0));
    assert_eq!(stdout(&status), "Daemon is stopped.\n");
}

#[test]
fn test_stale_marker_reported_as_running() {
    let sandbox = Sandbox::new("1\n");
    fs::write(sandbox.pid_file(), "999999\n").unwrap();

    let status = sandbox.run(&["status"]);
    assert_eq!(stdout(&status), "Daemon is running with pid: 999999.\n");
}

#[test]
fn test_malformed_marker_reported_not_signalled() {
    let sandbox = Sandbox::new("1\n");
    fs::write(sandbox.pid_file(), "0\n").unwrap();

    let status = sandbox.run(&["status"]);
    assert_eq!(status.status.code(), Some(0));
    assert_eq!(stdout(&status), "Daemon is running with pid: 0.\n");

    // kill(0, SIGINT) would interrupt this test's own process group
    let stop = sandbox.run(&["stop"]);
    assert_eq!(stop.status.code(), Some(0));
    assert!(stdout(&stop).contains("not signalling"));
    assert!(sandbox.pid_file().exists());
}

/// Every termination signal runs the delete-then-die path
#[test]
fn test_each_termination_signal_removes_marker() {
    for signal in [
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGTERM,
        Signal::SIGQUIT,
    ] {
        let sandbox = Sandbox::new("1\n");

        let start = sandbox.run(&["start"]);
        assert_eq!(start.status.code(), Some(0));
        assert!(
            wait_until(Duration::from_secs(10), || sandbox.recorded_pid().is_some()),
            "marker never appeared before {:?}",
            signal
        );
        let pid = sandbox.recorded_pid().unwrap();
        let mut reaper = Reaper(Some(pid));

        // Marker is written just before the handlers are installed
        assert!(
            wait_until(Duration::from_secs(10), || catches_signal(pid, signal)),
            "no handler for {:?}",
            signal
        );
        kill(Pid::from_raw(pid), signal).unwrap();
        assert!(
            wait_until(Duration::from_secs(10), || !sandbox.pid_file().exists()),
            "marker left after {:?}",
            signal
        );
        reaper.0 = None;
    }
}

#[test]
fn test_usage_errors_exit_one() {
    let sandbox = Sandbox::new("1\n");

    for args in [&[][..], &["start", "stop"][..], &["restart"][..]] {
        let output = sandbox.run(args);
        assert_eq!(output.status.code(), Some(1), "args {:?}", args);
        assert!(!output.stderr.is_empty());
    }
    assert!(!sandbox.pid_file().exists());
}
