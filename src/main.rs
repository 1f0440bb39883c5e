use anyhow::{Context, Result};
use clap::Parser;
use shutdown_daemon::config::{Cli, GPIO_PIN, POLL_INTERVAL};
use shutdown_daemon::control::{dispatch, KillSignaller, StartDecision};
use shutdown_daemon::daemon::{Daemonized, Daemonizer, SystemProcess};
use shutdown_daemon::gpio::{GpioInput, InputLine, LevelFileInput};
use shutdown_daemon::marker::InstanceGuard;
use shutdown_daemon::monitor::{CommandShutdown, Monitor, MonitorExit};
use shutdown_daemon::signals;
use std::io;
use std::path;
use std::process;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage errors exit 1; --help/--version exit 0
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            process::exit(code);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("[shutdown-daemon] Error: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    // The daemon chdirs to "/", so every path must be absolute beforehand
    let pid_file = path::absolute(&cli.pid_file)
        .with_context(|| format!("Invalid pid file path {}", cli.pid_file.display()))?;
    let guard = InstanceGuard::new(pid_file);

    let mut stdout = io::stdout();
    match dispatch(cli.command, &guard, &mut KillSignaller, &mut stdout)? {
        Some(StartDecision::Launch) => launch(&cli, &guard),
        Some(StartDecision::AlreadyRunning) | None => Ok(()),
    }
}

fn launch(cli: &Cli, guard: &InstanceGuard) -> Result<()> {
    // Validate in the foreground, while errors are still visible
    let shutdown = CommandShutdown::from_command_line(&cli.shutdown_command)?;
    let level_file = cli.level_file.as_deref().map(path::absolute).transpose()?;

    let (pid, wake_pipe) = match Daemonizer::new(SystemProcess, guard).run()? {
        Daemonized::Parent => return Ok(()),
        Daemonized::Daemon { pid, signals } => (pid, signals),
    };

    let input: Box<dyn InputLine> = match level_file {
        Some(file) => Box::new(LevelFileInput::new(file)),
        None => match GpioInput::open(GPIO_PIN) {
            Ok(pin) => Box::new(pin),
            Err(e) => {
                let _ = guard.release();
                return Err(e);
            }
        },
    };

    let mut monitor = Monitor::new(input, shutdown, wake_pipe, POLL_INTERVAL);
    match monitor.run() {
        Ok(MonitorExit::TerminationRequested) => {}
        Err(e) => eprintln!("[shutdown-daemon] Monitor loop failed: {:#}", e),
    }
    signals::terminate(guard, pid)
}
