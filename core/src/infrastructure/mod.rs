//! Process-spawning backends.
//!
//! Everything that starts an external program goes through the
//! `CommandRunner` trait so the fleet logic can be exercised against a
//! recording mock.

pub mod runner;

pub use runner::{CommandOutput, CommandRunner, Invocation, MockRunner, ProcessRunner};
