//! Command Dispatcher: `start`, `stop`, `status`
//!
//! Every verb decides purely from the marker file. None of them checks
//! that the recorded pid is alive; a stale marker is reported as running.

use crate::config::{Command, GPIO_PIN};
use crate::marker::{InstanceGuard, Marker};
use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Write;

/// Delivers the stop request to a daemon pid
pub trait Signaller {
    fn interrupt(&mut self, pid: i32) -> Result<()>;
}

/// Sends SIGINT via kill(2)
pub struct KillSignaller;

impl Signaller for KillSignaller {
    fn interrupt(&mut self, pid: i32) -> Result<()> {
        kill(Pid::from_raw(pid), Signal::SIGINT)?;
        Ok(())
    }
}

/// What the caller must do after `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// Marker present; nothing to do
    AlreadyRunning,
    /// Marker absent; daemonize and run the monitor loop
    Launch,
}

/// Decide whether to launch, printing the banner when we do
pub fn start(guard: &InstanceGuard, out: &mut impl Write) -> Result<StartDecision> {
    if guard.exists() {
        writeln!(out, "Daemon is already running.")?;
        return Ok(StartDecision::AlreadyRunning);
    }

    writeln!(out, "GPIO shutdown daemon")?;
    writeln!(out, "Monitoring GPIO PORT {}", GPIO_PIN)?;
    writeln!(out, "Daemon starting...")?;
    out.flush()?;
    Ok(StartDecision::Launch)
}

/// Send SIGINT to the recorded pid; does not wait for it to exit
pub fn stop(
    guard: &InstanceGuard,
    signaller: &mut impl Signaller,
    out: &mut impl Write,
) -> Result<()> {
    let pid = match guard.read()? {
        None => {
            writeln!(out, "Daemon is not running.")?;
            return Ok(());
        }
        Some(Marker::Pid(pid)) => pid,
        Some(Marker::Invalid(raw)) => {
            // kill(0) or kill(-n) would hit whole process groups
            writeln!(out, "Daemon pid file holds invalid pid {:?}; not signalling.", raw)?;
            return Ok(());
        }
    };

    write!(out, "Stopping daemon...")?;
    if let Err(e) = signaller.interrupt(pid) {
        // Stale marker: reported, not repaired
        eprintln!("[control] Failed to signal pid {}: {:#}", pid, e);
    }
    writeln!(out, " stopped!")?;
    Ok(())
}

/// Report running/stopped from the marker alone
pub fn status(guard: &InstanceGuard, out: &mut impl Write) -> Result<()> {
    match guard.read()? {
        Some(Marker::Pid(pid)) => writeln!(out, "Daemon is running with pid: {}.", pid)?,
        Some(Marker::Invalid(raw)) => writeln!(out, "Daemon is running with pid: {}.", raw)?,
        None => writeln!(out, "Daemon is stopped.")?,
    }
    Ok(())
}

/// Run `stop` or `status`; `start` only yields its decision
pub fn dispatch(
    command: Command,
    guard: &InstanceGuard,
    signaller: &mut impl Signaller,
    out: &mut impl Write,
) -> Result<Option<StartDecision>> {
    match command {
        Command::Start => start(guard, out).map(Some),
        Command::Stop => stop(guard, signaller, out).map(|_| None),
        Command::Status => status(guard, out).map(|_| None),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
