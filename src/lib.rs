//! Shutdown Daemon Library
//!
//! Watches one GPIO input and halts the system when it is pulled low.
//! The binary entry point is in main.rs; modules are public for integration testing.

pub mod config;
pub mod control;
pub mod daemon;
pub mod gpio;
pub mod marker;
pub mod monitor;
pub mod signals;
