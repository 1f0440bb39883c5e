//! Control Integration Tests
//!
//! Library-level tests for the dispatcher and the instance guard against
//! real processes and concurrent callers.

use shutdown_daemon::config::Command as Verb;
use shutdown_daemon::control::{dispatch, stop, KillSignaller, StartDecision};
use shutdown_daemon::marker::{InstanceGuard, Release};
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use wait_timeout::ChildExt;

/// `stop` delivers SIGINT to whatever pid the marker records
#[test]
fn test_stop_interrupts_recorded_process() {
    let dir = TempDir::new().unwrap();
    let guard = InstanceGuard::new(dir.path().join("daemon.pid"));

    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    assert!(guard.try_acquire(child.id() as i32).unwrap());

    let mut out = Vec::new();
    stop(&guard, &mut KillSignaller, &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "Stopping daemon... stopped!\n");

    let status = child
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("child survived SIGINT");
    assert_eq!(status.signal(), Some(libc::SIGINT));
}

/// Racing acquirers: exactly one wins, the marker names the winner
#[test]
fn test_concurrent_acquire_single_winner() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("daemon.pid");
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (1..=8)
        .map(|pid| {
            let guard = InstanceGuard::new(&path);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (pid, guard.try_acquire(pid).unwrap())
            })
        })
        .collect();

    let winners: Vec<i32> = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|(_, won)| *won)
        .map(|(pid, _)| pid)
        .collect();

    assert_eq!(winners.len(), 1);
    let guard = InstanceGuard::new(&path);
    assert_eq!(guard.read_pid().unwrap(), Some(winners[0]));
}

/// Release after a foreign pid leaves the marker, the owner can still release
#[test]
fn test_release_converges_to_absent() {
    let dir = TempDir::new().unwrap();
    let guard = InstanceGuard::new(dir.path().join("daemon.pid"));
    guard.try_acquire(10).unwrap();

    assert_eq!(guard.release_if_owned(11).unwrap(), Release::Foreign(10));
    assert_eq!(guard.release_if_owned(10).unwrap(), Release::Removed);
    assert_eq!(guard.release_if_owned(10).unwrap(), Release::Absent);

    let mut out = Vec::new();
    let decision = dispatch(Verb::Start, &guard, &mut KillSignaller, &mut out).unwrap();
    assert_eq!(decision, Some(StartDecision::Launch));
}
