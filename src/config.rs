//! Configuration
//! - Source constants for the monitored pin and poll cadence
//! - CLI argument parsing with clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Source Constants
// =============================================================================

/// BCM number of the monitored input pin
pub const GPIO_PIN: u8 = 21;

/// Delay between two samples of the input pin
pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Well-known marker file recording the running daemon's pid
pub const DEFAULT_PID_FILE: &str = "/run/shutdown_daemon.pid";

/// Command line that halts the system
pub const DEFAULT_SHUTDOWN_COMMAND: &str = "shutdown -h now";

// =============================================================================
// CLI Configuration
// =============================================================================

/// Shutdown daemon - halts the system when the shutdown button is pressed
#[derive(Parser, Debug)]
#[command(name = "shutdown-daemon", version, about = "GPIO shutdown button daemon")]
pub struct Cli {
    /// Marker file holding the daemon pid (also: SHUTDOWN_DAEMON_PID_FILE env var)
    #[arg(long, default_value = DEFAULT_PID_FILE, env = "SHUTDOWN_DAEMON_PID_FILE")]
    pub pid_file: PathBuf,

    /// Read the input level from a file instead of the GPIO chip
    #[arg(long, env = "SHUTDOWN_DAEMON_LEVEL_FILE", hide = true)]
    pub level_file: Option<PathBuf>,

    /// Command line run when the button is pressed
    #[arg(
        long,
        default_value = DEFAULT_SHUTDOWN_COMMAND,
        env = "SHUTDOWN_DAEMON_SHUTDOWN_COMMAND",
        hide = true
    )]
    pub shutdown_command: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Control verbs
#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the daemon unless it is already running
    Start,
    /// Signal the running daemon to stop
    Stop,
    /// Report whether the daemon is running
    Status,
}

/// Split a shutdown command line into program and arguments.
///
/// Returns `None` for a blank command line.
pub fn split_command_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut parts = line.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_parse_each_verb() {
        for (arg, expected) in [
            ("start", Command::Start),
            ("stop", Command::Stop),
            ("status", Command::Status),
        ] {
            let cli = Cli::try_parse_from(["shutdown-daemon", arg]).unwrap();
            assert_eq!(cli.command, expected);
        }
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["shutdown-daemon", "status"]).unwrap();
        assert_eq!(cli.pid_file, PathBuf::from(DEFAULT_PID_FILE));
        assert_eq!(cli.shutdown_command, DEFAULT_SHUTDOWN_COMMAND);
        assert!(cli.level_file.is_none());
    }

    #[test]
    fn test_missing_verb_rejected() {
        let err = Cli::try_parse_from(["shutdown-daemon"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_extra_argument_rejected() {
        let err = Cli::try_parse_from(["shutdown-daemon", "start", "now"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_unknown_verb_rejected() {
        let err = Cli::try_parse_from(["shutdown-daemon", "restart"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn test_pid_file_override() {
        let cli =
            Cli::try_parse_from(["shutdown-daemon", "--pid-file", "/tmp/x.pid", "stop"]).unwrap();
        assert_eq!(cli.pid_file, PathBuf::from("/tmp/x.pid"));
    }

    #[test]
    fn test_split_command_line() {
        let (program, args) = split_command_line("shutdown -h now").unwrap();
        assert_eq!(program, "shutdown");
        assert_eq!(args, vec!["-h", "now"]);
        assert!(split_command_line("   ").is_none());
    }
}
