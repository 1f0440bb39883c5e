//! Monitor Loop: sample the shutdown pin and halt on assertion
//!
//! Level-triggered: while the pin stays low, every iteration invokes the
//! shutdown action again. A successful halt ends the process anyway.

use crate::config::split_command_line;
use crate::gpio::InputLine;
use crate::signals::{Wake, Waiter};
use anyhow::{bail, Context, Result};
use std::process::Command;
use std::time::Duration;

/// Opaque "halt the system now"
pub trait ShutdownAction {
    fn halt(&mut self) -> Result<()>;
}

/// Runs an OS command line, e.g. `shutdown -h now`
pub struct CommandShutdown {
    program: String,
    args: Vec<String>,
}

impl CommandShutdown {
    pub fn from_command_line(line: &str) -> Result<Self> {
        let Some((program, args)) = split_command_line(line) else {
            bail!("Empty shutdown command");
        };
        Ok(Self { program, args })
    }
}

impl ShutdownAction for CommandShutdown {
    fn halt(&mut self) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .with_context(|| format!("Failed to execute '{}'", self.program))?;
        if !status.success() {
            bail!("'{}' exited with {}", self.program, status);
        }
        Ok(())
    }
}

/// Why the loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    TerminationRequested,
}

pub struct Monitor<I, S, W> {
    input: I,
    shutdown: S,
    waiter: W,
    interval: Duration,
}

impl<I: InputLine, S: ShutdownAction, W: Waiter> Monitor<I, S, W> {
    pub fn new(input: I, shutdown: S, waiter: W, interval: Duration) -> Self {
        Self {
            input,
            shutdown,
            waiter,
            interval,
        }
    }

    /// One sample; true if the shutdown action was invoked
    pub fn poll_once(&mut self) -> bool {
        let asserted = match self.input.read_level() {
            Ok(level) => level.is_asserted(),
            Err(e) => {
                eprintln!("[monitor] Failed to read input: {:#}", e);
                false
            }
        };
        if !asserted {
            return false;
        }

        eprintln!("[monitor] Shutting down...");
        if let Err(e) = self.shutdown.halt() {
            eprintln!("[monitor] Shutdown action failed: {:#}", e);
        }
        true
    }

    /// Sample forever until a termination request wakes the wait
    pub fn run(&mut self) -> Result<MonitorExit> {
        loop {
            self.poll_once();
            match self.waiter.wait(self.interval)? {
                Wake::Elapsed => continue,
                Wake::Terminate => return Ok(MonitorExit::TerminationRequested),
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Level;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Replays scripted levels, then repeats the last one
    struct ScriptedInput {
        levels: VecDeque<Level>,
        last: Level,
    }

    impl ScriptedInput {
        fn new(levels: &[Level]) -> Self {
            Self {
                levels: levels.iter().copied().collect(),
                last: Level::High,
            }
        }
    }

    impl InputLine for ScriptedInput {
        fn read_level(&mut self) -> Result<Level> {
            if let Some(l) = self.levels.pop_front() {
                self.last = l;
            }
            Ok(self.last)
        }
    }

    struct BrokenInput;

    impl InputLine for BrokenInput {
        fn read_level(&mut self) -> Result<Level> {
            bail!("no chip")
        }
    }

    /// Counts halts; records the number of waits elapsed at each halt
    #[derive(Clone, Default)]
    struct CountingShutdown {
        halts: Rc<RefCell<Vec<usize>>>,
        waits: Rc<Cell<usize>>,
        fail: bool,
    }

    impl ShutdownAction for CountingShutdown {
        fn halt(&mut self) -> Result<()> {
            self.halts.borrow_mut().push(self.waits.get());
            if self.fail {
                bail!("permission denied");
            }
            Ok(())
        }
    }

    /// Elapses `budget` times, then requests termination
    struct BudgetWaiter {
        budget: usize,
        waits: Rc<Cell<usize>>,
        timeouts: Vec<Duration>,
    }

    impl Waiter for BudgetWaiter {
        fn wait(&mut self, timeout: Duration) -> Result<Wake> {
            self.timeouts.push(timeout);
            if self.waits.get() >= self.budget {
                return Ok(Wake::Terminate);
            }
            self.waits.set(self.waits.get() + 1);
            Ok(Wake::Elapsed)
        }
    }

    fn monitor<I: InputLine>(
        input: I,
        shutdown: CountingShutdown,
        budget: usize,
    ) -> Monitor<I, CountingShutdown, BudgetWaiter> {
        let waiter = BudgetWaiter {
            budget,
            waits: shutdown.waits.clone(),
            timeouts: Vec::new(),
        };
        Monitor::new(input, shutdown, waiter, Duration::from_millis(1000))
    }

    #[test]
    fn test_no_halt_while_released() {
        let shutdown = CountingShutdown::default();
        let mut m = monitor(ScriptedInput::new(&[Level::High]), shutdown.clone(), 5);

        assert_eq!(m.run().unwrap(), MonitorExit::TerminationRequested);
        assert!(shutdown.halts.borrow().is_empty());
    }

    #[test]
    fn test_halt_before_next_interval() {
        // High, High, then pressed on the third sample
        let shutdown = CountingShutdown::default();
        let input = ScriptedInput::new(&[Level::High, Level::High, Level::Low, Level::High]);
        let mut m = monitor(input, shutdown.clone(), 5);

        m.run().unwrap();
        // Invoked after two waits, i.e. during the third sample, before the third wait
        assert_eq!(*shutdown.halts.borrow(), vec![2]);
    }

    #[test]
    fn test_halt_repeats_while_asserted() {
        let shutdown = CountingShutdown::default();
        let mut m = monitor(ScriptedInput::new(&[Level::Low]), shutdown.clone(), 3);

        m.run().unwrap();
        assert_eq!(*shutdown.halts.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_failed_halt_keeps_polling() {
        let shutdown = CountingShutdown {
            fail: true,
            ..Default::default()
        };
        let mut m = monitor(ScriptedInput::new(&[Level::Low]), shutdown.clone(), 2);

        assert_eq!(m.run().unwrap(), MonitorExit::TerminationRequested);
        assert_eq!(shutdown.halts.borrow().len(), 3);
    }

    #[test]
    fn test_read_error_is_not_assertion() {
        let shutdown = CountingShutdown::default();
        let mut m = monitor(BrokenInput, shutdown.clone(), 2);

        m.run().unwrap();
        assert!(shutdown.halts.borrow().is_empty());
    }

    #[test]
    fn test_waits_use_poll_interval() {
        let shutdown = CountingShutdown::default();
        let mut m = monitor(ScriptedInput::new(&[Level::High]), shutdown, 2);

        m.run().unwrap();
        assert!(m
            .waiter
            .timeouts
            .iter()
            .all(|t| *t == Duration::from_millis(1000)));
        assert_eq!(m.waiter.timeouts.len(), 3);
    }

    #[test]
    fn test_command_shutdown_parsing() {
        assert!(CommandShutdown::from_command_line("").is_err());
        let cmd = CommandShutdown::from_command_line("shutdown -h now").unwrap();
        assert_eq!(cmd.program, "shutdown");
        assert_eq!(cmd.args, vec!["-h", "now"]);
    }

    #[test]
    fn test_command_shutdown_runs_program() {
        let mut ok = CommandShutdown::from_command_line("true").unwrap();
        assert!(ok.halt().is_ok());

        let mut failing = CommandShutdown::from_command_line("false").unwrap();
        assert!(failing.halt().is_err());
    }
}
