//! Daemonizer: detach into a background process and publish the marker
//!
//! Implemented as an explicit state machine so every stage can be driven
//! and failed in isolation through a fake `ProcessControl`.
//!
//! CRITICAL SEQUENCE:
//! 1. Fork; the launcher exits 0 immediately
//! 2. setsid (drop the controlling terminal)
//! 3. Fork again; the session leader exits 0, the daemon can never
//!    reacquire a terminal
//! 4. umask(0), chdir("/"), close every inherited descriptor
//! 5. Write the marker (create-exclusive)
//! 6. Route termination signals into the self-pipe
//!
//! Any failure before step 5 leaves no marker behind, so `start` can be retried.

use crate::marker::InstanceGuard;
use crate::signals::TerminationPipe;
use anyhow::{bail, Context, Result};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, fork, getpid, setsid, sysconf, ForkResult, SysconfVar};
use std::fmt;

/// Daemonization stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FirstFork,
    NewSession,
    SecondFork,
    ResetEnvironment,
    WriteMarker,
    InstallSignals,
    Ready,
}

impl Stage {
    fn next(self) -> Stage {
        match self {
            Stage::FirstFork => Stage::NewSession,
            Stage::NewSession => Stage::SecondFork,
            Stage::SecondFork => Stage::ResetEnvironment,
            Stage::ResetEnvironment => Stage::WriteMarker,
            Stage::WriteMarker => Stage::InstallSignals,
            Stage::InstallSignals => Stage::Ready,
            Stage::Ready => Stage::Ready,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::FirstFork => "first fork",
            Stage::NewSession => "setsid",
            Stage::SecondFork => "second fork",
            Stage::ResetEnvironment => "environment reset",
            Stage::WriteMarker => "marker write",
            Stage::InstallSignals => "signal install",
            Stage::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Which side of a fork we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent,
    Child,
}

/// OS process primitives used while daemonizing
pub trait ProcessControl {
    /// Handle returned once termination signals are routed
    type Signals;

    fn fork(&mut self) -> Result<Fork>;
    fn new_session(&mut self) -> Result<()>;
    fn reset_umask(&mut self);
    fn chdir_root(&mut self) -> Result<()>;
    fn close_inherited_fds(&mut self) -> Result<()>;
    fn pid(&self) -> i32;
    fn install_signals(&mut self) -> Result<Self::Signals>;
}

/// Result of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Moved on to the given stage
    Advanced(Stage),
    /// This process is a fork parent and must exit successfully
    ExitParent,
}

/// Final outcome of `Daemonizer::run`
pub enum Daemonized<S> {
    /// Launcher or intermediate session leader: exit 0
    Parent,
    /// The detached daemon, marker written and signals routed
    Daemon { pid: i32, signals: S },
}

pub struct Daemonizer<'g, P: ProcessControl> {
    process: P,
    guard: &'g InstanceGuard,
    stage: Stage,
    pid: Option<i32>,
    signals: Option<P::Signals>,
}

impl<'g, P: ProcessControl> Daemonizer<'g, P> {
    pub fn new(process: P, guard: &'g InstanceGuard) -> Self {
        Self {
            process,
            guard,
            stage: Stage::FirstFork,
            pid: None,
            signals: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Execute the current stage
    pub fn step(&mut self) -> Result<Transition> {
        let stage = self.stage;
        match stage {
            Stage::FirstFork | Stage::SecondFork => {
                let side = self
                    .process
                    .fork()
                    .with_context(|| format!("{} failed", stage))?;
                if side == Fork::Parent {
                    return Ok(Transition::ExitParent);
                }
            }
            Stage::NewSession => {
                self.process
                    .new_session()
                    .with_context(|| format!("{} failed", stage))?;
            }
            Stage::ResetEnvironment => {
                self.process.reset_umask();
                self.process
                    .chdir_root()
                    .with_context(|| format!("{} failed", stage))?;
                self.process
                    .close_inherited_fds()
                    .with_context(|| format!("{} failed", stage))?;
            }
            Stage::WriteMarker => {
                let pid = self.process.pid();
                let acquired = self
                    .guard
                    .try_acquire(pid)
                    .with_context(|| format!("{} failed", stage))?;
                if !acquired {
                    bail!(
                        "{} failed: {} already exists",
                        stage,
                        self.guard.path().display()
                    );
                }
                self.pid = Some(pid);
            }
            Stage::InstallSignals => match self.process.install_signals() {
                Ok(signals) => self.signals = Some(signals),
                Err(e) => {
                    // Marker is ours; without handlers nobody would remove it
                    let _ = self.guard.release();
                    return Err(e.context(format!("{} failed", stage)));
                }
            },
            Stage::Ready => return Ok(Transition::Advanced(Stage::Ready)),
        }

        self.stage = stage.next();
        Ok(Transition::Advanced(self.stage))
    }

    /// Drive all stages until this process is a parent or the ready daemon
    pub fn run(mut self) -> Result<Daemonized<P::Signals>> {
        loop {
            match self.step()? {
                Transition::ExitParent => return Ok(Daemonized::Parent),
                Transition::Advanced(Stage::Ready) => break,
                Transition::Advanced(_) => continue,
            }
        }

        match (self.pid, self.signals.take()) {
            (Some(pid), Some(signals)) => Ok(Daemonized::Daemon { pid, signals }),
            _ => bail!("Daemonizer reached ready without marker or signals"),
        }
    }
}

// =============================================================================
// Real Process Control
// =============================================================================

/// `ProcessControl` backed by nix/libc syscalls
pub struct SystemProcess;

impl ProcessControl for SystemProcess {
    type Signals = TerminationPipe;

    fn fork(&mut self) -> Result<Fork> {
        // SAFETY: the daemon is single-threaded while forking
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => Ok(Fork::Parent),
            ForkResult::Child => Ok(Fork::Child),
        }
    }

    fn new_session(&mut self) -> Result<()> {
        setsid()?;
        Ok(())
    }

    fn reset_umask(&mut self) {
        umask(Mode::empty());
    }

    fn chdir_root(&mut self) -> Result<()> {
        chdir("/")?;
        Ok(())
    }

    fn close_inherited_fds(&mut self) -> Result<()> {
        // close_range(2) where available, otherwise walk the table
        let closed = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                0 as libc::c_long,
                u32::MAX as libc::c_long,
                0 as libc::c_long,
            )
        } == 0;
        if !closed {
            let max = sysconf(SysconfVar::OPEN_MAX)?.unwrap_or(1024);
            for fd in (0..max).rev() {
                unsafe {
                    libc::close(fd as libc::c_int);
                }
            }
        }

        // Park stdio on /dev/null so later opens never land on 0/1/2
        let null = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
        if null < 0 {
            return Err(std::io::Error::last_os_error()).context("Failed to open /dev/null");
        }
        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if null != target && unsafe { libc::dup2(null, target) } < 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("dup2 onto fd {} failed", target));
            }
        }
        if null > libc::STDERR_FILENO {
            unsafe {
                libc::close(null);
            }
        }
        Ok(())
    }

    fn pid(&self) -> i32 {
        getpid().as_raw()
    }

    fn install_signals(&mut self) -> Result<TerminationPipe> {
        TerminationPipe::install()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
