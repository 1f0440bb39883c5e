//! Signal Handling for the Termination Path
//!
//! Termination signals (INT, HUP, TERM, QUIT) never run cleanup in signal
//! context. The async handler only writes a byte into a self-pipe; the
//! monitor loop sleeps by polling the read end, so a signal wakes it
//! immediately and the marker cleanup runs on the main control flow.
//!
//! ## Delete-then-die
//!
//! `terminate` removes the marker if this process owns it, then aborts.
//! The abort is unconditional: a foreign or missing marker is logged but
//! the process still ends.

use crate::marker::{InstanceGuard, Release};
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::low_level::pipe;
use std::io::{ErrorKind, Read};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

/// Signals that trigger the termination path
pub const TERMINATION_SIGNALS: [i32; 4] = [SIGINT, SIGHUP, SIGTERM, SIGQUIT];

/// Why a wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The full interval passed
    Elapsed,
    /// A termination signal arrived
    Terminate,
}

/// Interruptible sleep between two samples
pub trait Waiter {
    fn wait(&mut self, timeout: Duration) -> Result<Wake>;
}

/// Read end of the signal self-pipe
pub struct TerminationPipe {
    read: UnixStream,
}

impl TerminationPipe {
    /// Route every termination signal into a fresh self-pipe
    pub fn install() -> Result<Self> {
        let (read, write) = UnixStream::pair().context("Failed to create signal pipe")?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;

        for &sig in TERMINATION_SIGNALS.iter() {
            let end = write.try_clone().context("Failed to clone signal pipe")?;
            pipe::register(sig, end)
                .with_context(|| format!("Failed to register handler for signal {}", sig))?;
        }

        Ok(Self { read })
    }

    /// Consume pending wake-up bytes, true if any were read
    fn drain(&mut self) -> Result<bool> {
        let mut buf = [0u8; 16];
        let mut woke = false;
        loop {
            match self.read.read(&mut buf) {
                Ok(0) => bail!("Signal pipe closed"),
                Ok(_) => woke = true,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(woke),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read signal pipe"),
            }
        }
    }
}

/// poll(2) timeout for `remaining`, rounded up so a sub-millisecond
/// remainder still blocks instead of spinning
fn poll_timeout_millis(remaining: Duration) -> u16 {
    u16::try_from(remaining.as_micros().div_ceil(1000)).unwrap_or(u16::MAX)
}

impl Waiter for TerminationPipe {
    fn wait(&mut self, timeout: Duration) -> Result<Wake> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = poll_timeout_millis(remaining);

            let ready = {
                let mut fds = [PollFd::new(self.read.as_fd(), PollFlags::POLLIN)];
                poll(&mut fds, PollTimeout::from(millis))
            };
            match ready {
                Ok(0) if remaining.is_zero() => return Ok(Wake::Elapsed),
                Ok(0) => continue,
                Ok(_) if self.drain()? => return Ok(Wake::Terminate),
                Ok(_) => continue,
                // Handler wrote to the pipe; next poll sees it
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("poll on signal pipe failed"),
            }
        }
    }
}

/// Marker half of `terminate`: remove it if owned by `pid` and log the outcome
pub fn release_marker(guard: &InstanceGuard, pid: i32) -> Option<Release> {
    match guard.release_if_owned(pid) {
        Ok(Release::Removed) => {
            eprintln!("[signals] Removed {}", guard.path().display());
            Some(Release::Removed)
        }
        Ok(Release::Absent) => {
            eprintln!("[signals] Marker {} already gone", guard.path().display());
            Some(Release::Absent)
        }
        Ok(Release::Foreign(other)) => {
            // Ownership mismatch: keep the file, still terminate
            eprintln!(
                "[signals] Marker {} names pid {}, not {}; leaving it",
                guard.path().display(),
                other,
                pid
            );
            Some(Release::Foreign(other))
        }
        Err(e) => {
            eprintln!("[signals] Marker cleanup failed: {:#}", e);
            None
        }
    }
}

/// Delete-then-die: release the marker if owned, then abort the process
pub fn terminate(guard: &InstanceGuard, pid: i32) -> ! {
    eprintln!("[signals] Termination requested, shutting down...");
    release_marker(guard, pid);
    std::process::abort()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_termination_signal_set() {
        assert_eq!(TERMINATION_SIGNALS.len(), 4);
        assert!(TERMINATION_SIGNALS.contains(&SIGINT));
        assert!(TERMINATION_SIGNALS.contains(&SIGHUP));
        assert!(TERMINATION_SIGNALS.contains(&SIGTERM));
        assert!(TERMINATION_SIGNALS.contains(&SIGQUIT));
    }

    #[test]
    fn test_release_marker_owned() {
        let dir = TempDir::new().unwrap();
        let guard = InstanceGuard::new(dir.path().join("d.pid"));
        guard.try_acquire(321).unwrap();

        assert_eq!(release_marker(&guard, 321), Some(Release::Removed));
        assert!(!guard.exists());
    }

    #[test]
    fn test_release_marker_foreign_kept() {
        let dir = TempDir::new().unwrap();
        let guard = InstanceGuard::new(dir.path().join("d.pid"));
        guard.try_acquire(321).unwrap();

        assert_eq!(release_marker(&guard, 999), Some(Release::Foreign(321)));
        assert!(guard.exists());
    }

    #[test]
    fn test_release_marker_absent() {
        let dir = TempDir::new().unwrap();
        let guard = InstanceGuard::new(dir.path().join("d.pid"));
        assert_eq!(release_marker(&guard, 1), Some(Release::Absent));
    }

    #[test]
    fn test_release_marker_corrupt() {
        let dir = TempDir::new().unwrap();
        let guard = InstanceGuard::new(dir.path().join("d.pid"));
        std::fs::write(guard.path(), "garbage").unwrap();

        assert_eq!(release_marker(&guard, 1), None);
        assert!(guard.exists());
    }

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout_millis(Duration::ZERO), 0);
        assert_eq!(poll_timeout_millis(Duration::from_micros(1)), 1);
        assert_eq!(poll_timeout_millis(Duration::from_micros(300)), 1);
        assert_eq!(poll_timeout_millis(Duration::from_micros(1001)), 2);
        assert_eq!(poll_timeout_millis(Duration::from_millis(1000)), 1000);
        assert_eq!(poll_timeout_millis(Duration::from_secs(3600)), u16::MAX);
    }

    #[test]
    fn test_pipe_wait_elapses_without_signal() {
        let (read, _write) = UnixStream::pair().unwrap();
        read.set_nonblocking(true).unwrap();
        let mut pipe = TerminationPipe { read };

        let start = Instant::now();
        assert_eq!(pipe.wait(Duration::from_millis(50)).unwrap(), Wake::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_pipe_wakes_on_pending_byte() {
        use std::io::Write;

        let (read, mut write) = UnixStream::pair().unwrap();
        read.set_nonblocking(true).unwrap();
        let mut pipe = TerminationPipe { read };
        write.write_all(&[1]).unwrap();

        let start = Instant::now();
        assert_eq!(pipe.wait(Duration::from_secs(5)).unwrap(), Wake::Terminate);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
