//! Instance Guard: the singleton marker file
//!
//! The marker's existence is the only record of "daemon is running".
//! Its content is the owning daemon's pid in decimal, newline-terminated.
//!
//! ## Ownership
//!
//! - Only the daemon writes the marker (`try_acquire`) and removes it
//!   (`release_if_owned`, or `release` when setup fails after acquiring).
//! - `stop` and `status` only read it.
//! - Acquisition is create-exclusive, so two racing `start`s can never both own it.

use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Owner read-write, everyone else read-only, whatever the umask
const MARKER_MODE: u32 = 0o644;

/// Contents of a present marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// A positive pid
    Pid(i32),
    /// Anything else, trimmed; never safe to signal
    Invalid(String),
}

/// Outcome of releasing the marker on termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Marker named us and has been deleted
    Removed,
    /// No marker on disk
    Absent,
    /// Marker names another pid; left in place
    Foreign(i32),
}

/// Handle on the well-known marker path
#[derive(Debug, Clone)]
pub struct InstanceGuard {
    path: PathBuf,
}

impl InstanceGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a marker is present (the daemon is considered running)
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the marker, `None` when absent.
    ///
    /// Fails only when the file exists but cannot be read.
    pub fn read(&self) -> Result<Option<Marker>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        let raw = contents.trim();
        Ok(Some(match raw.parse::<i32>() {
            Ok(pid) if pid > 0 => Marker::Pid(pid),
            _ => Marker::Invalid(raw.to_string()),
        }))
    }

    /// Read the recorded pid, `None` when no marker exists.
    ///
    /// Fails on unreadable or malformed content, or a pid that is not positive.
    pub fn read_pid(&self) -> Result<Option<i32>> {
        match self.read()? {
            None => Ok(None),
            Some(Marker::Pid(pid)) => Ok(Some(pid)),
            Some(Marker::Invalid(raw)) => {
                bail!("Invalid pid {:?} in {}", raw, self.path.display())
            }
        }
    }

    /// Create the marker holding `pid`.
    ///
    /// Returns `false` without touching anything if a marker already exists.
    pub fn try_acquire(&self, pid: i32) -> Result<bool> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(MARKER_MODE)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create {}", self.path.display()))
            }
        };

        if let Err(e) = writeln!(file, "{}", pid).and_then(|_| file.sync_all()) {
            // Half-written marker would read as corrupt; drop it
            let _ = fs::remove_file(&self.path);
            return Err(e).with_context(|| format!("Failed to write {}", self.path.display()));
        }
        Ok(true)
    }

    /// Delete the marker if it records `pid`.
    pub fn release_if_owned(&self, pid: i32) -> Result<Release> {
        let recorded = match self.read_pid()? {
            Some(p) => p,
            None => return Ok(Release::Absent),
        };
        if recorded != pid {
            return Ok(Release::Foreign(recorded));
        }

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(Release::Removed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Release::Absent),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }

    /// Delete the marker unconditionally (setup failed after acquiring it)
    pub fn release(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
