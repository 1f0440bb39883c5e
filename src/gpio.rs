//! Input line sampling
//!
//! The button pulls the pin low; a pull-up keeps it high otherwise.

use anyhow::{bail, Context, Result};
use rppal::gpio::Gpio;
use std::fs;
use std::path::PathBuf;

/// Digital level of an input pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    /// Low means the shutdown button is pressed
    pub fn is_asserted(self) -> bool {
        self == Level::Low
    }
}

/// A readable digital input
pub trait InputLine {
    fn read_level(&mut self) -> Result<Level>;
}

impl<T: InputLine + ?Sized> InputLine for Box<T> {
    fn read_level(&mut self) -> Result<Level> {
        (**self).read_level()
    }
}

/// BCM pin on the Raspberry Pi GPIO chip, configured as input with pull-up
pub struct GpioInput {
    pin: rppal::gpio::InputPin,
}

impl GpioInput {
    pub fn open(bcm_pin: u8) -> Result<Self> {
        let gpio = Gpio::new().context("Failed to open GPIO chip")?;
        let pin = gpio
            .get(bcm_pin)
            .with_context(|| format!("Failed to acquire GPIO {}", bcm_pin))?
            .into_input_pullup();
        Ok(Self { pin })
    }
}

impl InputLine for GpioInput {
    fn read_level(&mut self) -> Result<Level> {
        Ok(match self.pin.read() {
            rppal::gpio::Level::Low => Level::Low,
            rppal::gpio::Level::High => Level::High,
        })
    }
}

/// Simulated pin: a text file holding `0` (low) or `1` (high)
pub struct LevelFileInput {
    path: PathBuf,
}

impl LevelFileInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InputLine for LevelFileInput {
    fn read_level(&mut self) -> Result<Level> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        match contents.trim_start().chars().next() {
            Some('0') => Ok(Level::Low),
            Some('1') => Ok(Level::High),
            other => bail!("Unexpected level {:?} in {}", other, self.path.display()),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
